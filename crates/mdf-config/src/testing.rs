//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary upload root
//! - Converter scripts run through `sh`
//! - A matching `Config`
//!
//! # Usage
//!
//! ```ignore
//! use mdf_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let script = env.write_script("convert.sh", "echo converted \"$1\"").unwrap();
//!     let config = env.config_with_converter(&script);
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, ExitPolicy};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with its own upload root
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Upload root (exists)
    pub upload_dir: PathBuf,
    /// Directory for converter scripts
    pub scripts_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let upload_dir = root.join("uploads");
        let scripts_dir = root.join("scripts");

        std::fs::create_dir_all(&upload_dir)?;
        std::fs::create_dir_all(&scripts_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            upload_dir,
            scripts_dir,
            test_id,
        })
    }

    /// A path inside the environment that does not exist
    pub fn missing_dir(&self) -> PathBuf {
        self.upload_dir
            .with_file_name(format!("missing-{}", self.test_id))
    }

    /// Write a shell script body to `scripts_dir/name`.
    ///
    /// Scripts are run through `sh`, so they need no execute bit.
    pub fn write_script(&self, name: &str, body: &str) -> anyhow::Result<PathBuf> {
        let path = self.scripts_dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;
        Ok(path)
    }

    /// Config rooted at this environment, without a converter
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.upload_dir = self.upload_dir.clone();
        cfg.converter.settle_delay_ms = 0;
        cfg
    }

    /// Config rooted at this environment running `script` through `sh`
    pub fn config_with_converter(&self, script: &Path) -> Config {
        let mut cfg = self.config();
        cfg.converter.program = Some(script.to_path_buf());
        cfg.converter.interpreter = Some("sh".to_string());
        cfg.converter.exit_policy = ExitPolicy::Strict;
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
