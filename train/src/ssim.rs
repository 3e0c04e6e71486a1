use burn::tensor::{Tensor, backend::Backend, module::conv2d, ops::ConvOptions};

/// Gaussian windowed structural similarity over [N, C, H, W] images.
#[derive(Clone, Debug)]
pub(crate) struct Ssim {
    window: Vec<f32>,
    c1: f32,
    c2: f32,
}

fn gaussian(window_size: usize, sigma: f32) -> Vec<f32> {
    let window_extent = (window_size / 2) as f32;
    let vals: Vec<_> = (0..window_size)
        .map(|x| f32::exp(-(x as f32 - window_extent).powf(2.0) / (2.0 * sigma.powf(2.0))))
        .collect();
    let sum: f32 = vals.iter().sum();
    vals.into_iter().map(|v| v / sum).collect()
}

impl Ssim {
    /// `data_range` is the span of valid pixel values, 1.0 for normalized images.
    pub fn new(window_size: usize, data_range: f32) -> Self {
        // Even windows would shift the blurred image by half a pixel.
        let window_size = window_size.max(1) | 1;
        Self {
            window: gaussian(window_size, 1.5),
            c1: (0.01 * data_range).powf(2.0),
            c2: (0.03 * data_range).powf(2.0),
        }
    }

    fn gaussian_blur<B: Backend>(&self, img: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = img.dims()[1];
        let window_size = self.window.len();
        let padding = window_size / 2;

        // Channels out, in, h, w.
        let kernel_v = Tensor::<B, 1>::from_floats(self.window.as_slice(), &img.device())
            .reshape([1, 1, window_size, 1])
            .repeat_dim(0, channels);
        let kernel_h = kernel_v.clone().reshape([channels, 1, 1, window_size]);

        let conv_options_v = ConvOptions::new([1, 1], [padding, 0], [1, 1], channels);
        let conv_options_h = ConvOptions::new([1, 1], [0, padding], [1, 1], channels);

        let v_blur = conv2d(img, kernel_v, None, conv_options_v);
        conv2d(v_blur, kernel_h, None, conv_options_h)
    }

    /// Per pixel similarity map, same shape as the inputs.
    pub fn ssim<B: Backend>(&self, img1: Tensor<B, 4>, img2: Tensor<B, 4>) -> Tensor<B, 4> {
        let mu_x = self.gaussian_blur(img1.clone());
        let mu_y = self.gaussian_blur(img2.clone());
        let mu_xx = mu_x.clone() * mu_x.clone();
        let mu_yy = mu_y.clone() * mu_y.clone();
        let mu_xy = mu_x * mu_y;

        let sigma_xx = self.gaussian_blur(img1.clone() * img1.clone()) - mu_xx.clone();
        let sigma_yy = self.gaussian_blur(img2.clone() * img2.clone()) - mu_yy.clone();
        let sigma_xy = self.gaussian_blur(img1 * img2) - mu_xy.clone();

        ((mu_xy * 2.0 + self.c1) * (sigma_xy * 2.0 + self.c2))
            / ((mu_xx + mu_yy + self.c1) * (sigma_xx + sigma_yy + self.c2))
    }

    /// Mean similarity of every sample, shape [N].
    pub fn ssim_per_sample<B: Backend>(&self, img1: Tensor<B, 4>, img2: Tensor<B, 4>) -> Tensor<B, 1> {
        let n = img1.dims()[0];
        self.ssim(img1, img2)
            .flatten::<2>(1, 3)
            .mean_dim(1)
            .reshape([n])
    }
}
