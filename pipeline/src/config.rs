use burn::prelude::Config;

#[derive(Config, Debug)]
pub struct PipelineConfig {
    /// Random seed.
    #[config(default = 42)]
    pub seed: u64,

    /// Epoch to resume from.
    #[config(default = 0)]
    pub start_epoch: usize,

    /// Eval every this many epochs. The last epoch is always evaluated.
    #[config(default = 1)]
    pub eval_every: usize,

    /// Save the reconstruction of every evaluation to disk. Uses export-path for the file location.
    #[config(default = false)]
    pub eval_save_to_disk: bool,

    /// Checkpoint every this many epochs, 0 to only checkpoint at the end.
    #[config(default = 10)]
    pub checkpoint_every: usize,

    /// Location to put exported files. By default uses the cwd.
    ///
    /// This path can be set to be relative to the CWD.
    #[config(default = "String::from(\".\")")]
    pub export_path: String,

    /// Filename of checkpoints, `{epoch}` is replaced by the zero padded epoch.
    #[config(default = "String::from(\"checkpoint_e{epoch}\")")]
    pub checkpoint_name: String,
}

impl PipelineConfig {
    pub fn checkpoint_file(&self, epoch: usize) -> String {
        self.checkpoint_name.replace("{epoch}", &format!("{epoch:03}"))
    }
}
