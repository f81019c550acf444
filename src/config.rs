use std::time::Duration;

#[derive(Debug, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Kernel programming settings.
    #[serde(default)]
    pub dataplane: knpd::Config,

    /// Seconds between two reconciliations of the FORWARD jump and stale chains.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: u64,

    /// Sets and policies to apply after bootup (YAML, or JSON when the file ends in `.json`).
    pub desired_state: Option<String>,
}
fn default_reconcile_interval() -> u64 {
    300
}

impl Config {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval.max(1))
    }
}
