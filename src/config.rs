//! Project configuration, read from `[package.metadata.hil]` /
//! `[workspace.metadata.hil]` in the target project's `Cargo.toml`,
//! the same way the teacher reads `[package.metadata.rtic-scope]`
//! (see the historical `manifest.rs` pattern it is lifted from):
//! package-level metadata takes precedence over workspace-level, and
//! every field may be overridden by a CLI flag.
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::diag;

#[derive(Deserialize, Debug, Default, Clone)]
struct ConfigIntermediate {
    elf_path: Option<PathBuf>,
    server_binary: Option<PathBuf>,
    scripts_path: Option<PathBuf>,
    interface_cfg: Option<PathBuf>,
    target_cfg: Option<PathBuf>,
    tcl_port: Option<u16>,
    gdb_port: Option<u16>,
    rtt_text_port: Option<u16>,
    rtt_binary_port: Option<u16>,
    docker_prefix: Option<String>,
    token_db_path: Option<PathBuf>,
    build_dir: Option<PathBuf>,
    build_command: Option<Vec<String>>,
}

impl ConfigIntermediate {
    fn complete_with(&mut self, other: Self) {
        macro_rules! complete {
            ($($f:ident),+) => {{
                $(
                    if self.$f.is_none() {
                        self.$f = other.$f;
                    }
                )+
            }};
        }
        complete!(
            elf_path,
            server_binary,
            scripts_path,
            interface_cfg,
            target_cfg,
            tcl_port,
            gdb_port,
            rtt_text_port,
            rtt_binary_port,
            docker_prefix,
            token_db_path,
            build_dir,
            build_command
        );
    }
}

/// Resolved project configuration. Conventional port/path defaults
/// are filled in for anything the project's manifest and CLI flags
/// leave unspecified (§6 "Network ports (conventional defaults)").
#[derive(Debug, Clone)]
pub struct Config {
    pub elf_path: PathBuf,
    pub server_binary: Option<PathBuf>,
    pub scripts_path: Option<PathBuf>,
    pub interface_cfg: PathBuf,
    pub target_cfg: PathBuf,
    pub tcl_port: u16,
    pub gdb_port: u16,
    pub rtt_text_port: u16,
    pub rtt_binary_port: u16,
    pub docker_prefix: String,
    pub token_db_path: PathBuf,
    pub project_root: PathBuf,
    pub build_dir: PathBuf,
    pub build_command: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to run `cargo metadata`: {0}")]
    CargoMetadata(#[from] cargo_metadata::Error),
    #[error("failed to find root package from `cargo metadata`")]
    NoRootPackage,
    #[error("manifest metadata could not be read: {0}")]
    Deserialize(#[from] serde_json::Error),
}

impl diag::DiagnosableError for ConfigError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            ConfigError::NoRootPackage => vec![
                "Run this command from within a cargo project, or pass --manifest-path".into(),
            ],
            _ => vec![],
        }
    }
}

/// CLI-level overrides layered on top of the manifest, one field per
/// configurable item (§6).
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub elf_path: Option<PathBuf>,
    pub tcl_port: Option<u16>,
    pub rtt_text_port: Option<u16>,
    pub rtt_binary_port: Option<u16>,
    pub docker_prefix: Option<String>,
    pub token_db_path: Option<PathBuf>,
}

impl Config {
    pub fn load(project_root: &std::path::Path, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let metadata = cargo_metadata::MetadataCommand::new()
            .current_dir(project_root)
            .exec()?;

        let package_meta = metadata
            .root_package()
            .ok_or(ConfigError::NoRootPackage)?
            .metadata
            .get("hil");
        let workspace_meta = metadata.workspace_metadata.get("hil");

        let mut int = match (package_meta, workspace_meta) {
            (Some(pkg), Some(wrk)) => {
                let mut pkg: ConfigIntermediate = serde_json::from_value(pkg.to_owned())?;
                let wrk: ConfigIntermediate = serde_json::from_value(wrk.to_owned())?;
                pkg.complete_with(wrk);
                pkg
            }
            (Some(pkg), None) => serde_json::from_value(pkg.to_owned())?,
            (None, Some(wrk)) => serde_json::from_value(wrk.to_owned())?,
            (None, None) => ConfigIntermediate::default(),
        };

        if let Some(elf) = &overrides.elf_path {
            int.elf_path = Some(elf.clone());
        }
        if let Some(p) = overrides.tcl_port {
            int.tcl_port = Some(p);
        }
        if let Some(p) = overrides.rtt_text_port {
            int.rtt_text_port = Some(p);
        }
        if let Some(p) = overrides.rtt_binary_port {
            int.rtt_binary_port = Some(p);
        }
        if let Some(p) = &overrides.docker_prefix {
            int.docker_prefix = Some(p.clone());
        }
        if let Some(p) = &overrides.token_db_path {
            int.token_db_path = Some(p.clone());
        }

        let root: PathBuf = metadata.workspace_root.clone().into();

        Ok(Config {
            elf_path: int
                .elf_path
                .unwrap_or_else(|| PathBuf::from("build/firmware/app/firmware.elf")),
            server_binary: int.server_binary,
            scripts_path: int.scripts_path,
            interface_cfg: int
                .interface_cfg
                .unwrap_or_else(|| PathBuf::from("openocd/interface.cfg")),
            target_cfg: int
                .target_cfg
                .unwrap_or_else(|| PathBuf::from("openocd/target.cfg")),
            tcl_port: int.tcl_port.unwrap_or(6666),
            gdb_port: int.gdb_port.unwrap_or(3333),
            rtt_text_port: int.rtt_text_port.unwrap_or(9090),
            rtt_binary_port: int.rtt_binary_port.unwrap_or(9091),
            docker_prefix: int.docker_prefix.unwrap_or_else(|| "/workspace/".to_string()),
            token_db_path: int
                .token_db_path
                .unwrap_or_else(|| PathBuf::from("build/logging/tokens.csv")),
            build_dir: int.build_dir.unwrap_or_else(|| PathBuf::from("build")),
            build_command: int
                .build_command
                .unwrap_or_else(|| vec!["cargo".to_string(), "build".to_string()]),
            project_root: root,
        })
    }
}
