//! Common test utilities for SAMGUARD integration tests
#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

/// Path to the samguard binary
pub fn bin_path() -> PathBuf {
    env!("CARGO_BIN_EXE_samguard").into()
}

/// Create a test environment with an isolated data vault
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub data_dir: PathBuf,
}

impl TestEnv {
    /// Create a new test environment
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let data_dir = temp_dir.path().join(".samguard");

        std::fs::create_dir_all(&data_dir)?;

        Ok(Self { temp_dir, data_dir })
    }

    /// Get the path to a file in the data vault
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Create a command with environment variables set to use the test environment
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_samguard"));
        cmd.env("HOME", self.temp_dir.path());
        cmd.env_remove("SAMGUARD_CONFIG");
        cmd.env_remove("SAMGUARD_DB_PATH");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Write a config file into the data vault
    pub fn write_config(&self, content: &str) -> anyhow::Result<PathBuf> {
        let path = self.data_file("config.json");
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Config that keeps the error archive in memory
    pub fn write_memory_config(&self) -> anyhow::Result<PathBuf> {
        self.write_config(r#"{ "tracker": { "persistent": false } }"#)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
