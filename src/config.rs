//! Knobs for the dual-image check

pub const DEFAULT_MAIN_PARTITION: &str = "firmware";
pub const DEFAULT_BACKUP_PARTITION: &str = "firmware2";

/// What to conclude about two valid images when either has no fingerprint
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, clap::ValueEnum)]
pub enum UnknownFingerprint {
    /// Images that both lack a fingerprint are alike; an image with one never matches an
    /// image without
    #[default]
    Pairwise,

    /// Assume they differ, and rewrite the backup from main
    Restore,

    /// Assume they are the same, and leave both alone
    Trust,

    /// Compare the staged contents of both images byte for byte
    Compare,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualImageConfig {
    pub main_partition: String,
    pub backup_partition: String,
    pub unknown_fingerprint: UnknownFingerprint,

    /// Append the end-of-filesystem marker to restored images
    pub eofs_marker: bool,
}

impl Default for DualImageConfig {
    fn default() -> Self {
        Self {
            main_partition: DEFAULT_MAIN_PARTITION.to_string(),
            backup_partition: DEFAULT_BACKUP_PARTITION.to_string(),
            unknown_fingerprint: UnknownFingerprint::default(),
            eofs_marker: true,
        }
    }
}

impl DualImageConfig {
    pub fn main_partition(mut self, name: impl Into<String>) -> Self {
        self.main_partition = name.into();
        self
    }

    pub fn backup_partition(mut self, name: impl Into<String>) -> Self {
        self.backup_partition = name.into();
        self
    }

    pub fn unknown_fingerprint(mut self, policy: UnknownFingerprint) -> Self {
        self.unknown_fingerprint = policy;
        self
    }

    pub fn eofs_marker(mut self, enabled: bool) -> Self {
        self.eofs_marker = enabled;
        self
    }
}

#[test]
fn test_builder() {
    let config = DualImageConfig::default()
        .backup_partition("rescue")
        .unknown_fingerprint(UnknownFingerprint::Compare)
        .eofs_marker(false);

    assert_eq!(config.main_partition, "firmware");
    assert_eq!(config.backup_partition, "rescue");
    assert_eq!(config.unknown_fingerprint, UnknownFingerprint::Compare);
    assert!(!config.eofs_marker);

    let config = DualImageConfig::default();
    assert_eq!(config.unknown_fingerprint, UnknownFingerprint::Pairwise);
    assert!(config.eofs_marker);
}
