use metrics::Label;
use serde::Serialize;

use crate::backend::MeterDesc;
use crate::error::ResolutionError;

/// Host tag used when the local hostname cannot be determined.
pub const FALLBACK_HOST: &str = "unknown-host";

pub type HostResolver = fn() -> Result<String, ResolutionError>;

pub fn local_hostname() -> Result<String, ResolutionError> {
    sysinfo::System::host_name()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .ok_or(ResolutionError)
}

pub fn resolve_host(resolver: HostResolver) -> String {
    match resolver() {
        Ok(host) => host,
        Err(err) => {
            tracing::warn!(target: "cdcm.metrics", %err, fallback = FALLBACK_HOST, "using placeholder host tag");
            FALLBACK_HOST.to_string()
        }
    }
}

/// Dimension labels stamped on every metric of one pipeline instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommonTags {
    pub app: String,
    pub destination: String,
    pub host: String,
}

impl CommonTags {
    pub fn new(app: &str, destination: &str, host: &str) -> Self {
        Self {
            app: app.to_string(),
            destination: destination.to_string(),
            host: host.to_string(),
        }
    }

    pub fn labels(&self) -> Vec<Label> {
        vec![
            Label::new("app", self.app.clone()),
            Label::new("destination", self.destination.clone()),
            Label::new("host", self.host.clone()),
        ]
    }

    /// Labels for process-wide meters, which are not tied to a destination.
    pub fn process_labels(&self) -> Vec<Label> {
        vec![
            Label::new("app", self.app.clone()),
            Label::new("host", self.host.clone()),
        ]
    }

    pub fn meter(&self, name: &str, description: &str) -> MeterDesc {
        MeterDesc::new(name, description).tags(self.labels())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_lookup_falls_back_to_placeholder() {
        assert_eq!(resolve_host(|| Err(ResolutionError)), FALLBACK_HOST);
        assert_eq!(resolve_host(|| Ok("db-7".into())), "db-7");
    }

    #[test]
    fn meter_carries_all_common_tags() {
        let tags = CommonTags::new("cdc", "d1", "h1");
        let desc = tags.meter("m", "help").tag("mode", "spring");
        let keys: Vec<&str> = desc.labels.iter().map(|l| l.key()).collect();
        assert_eq!(keys, vec!["app", "destination", "host", "mode"]);
    }
}
