/// Progress message sent from the processing thread after each run
#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    pub progress: f32,
    pub run_index: usize,
    pub run_id: String,
}

impl RunStatus {
    pub fn new(progress: f32, run_index: usize, run_id: &str) -> Self {
        Self {
            progress,
            run_index,
            run_id: run_id.to_string(),
        }
    }
}
