//! Post-build compile-commands fixup (§4.13). Wraps the pure
//! `pathfix` transform with the I/O of finding the compilation
//! database under the project's build directory and applying the
//! rewrite in place, the way the teacher's `build.rs` wraps a plain
//! subprocess call with the path bookkeeping around it.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

use crate::diag;
use crate::pathfix;
use crate::result::HilResult;

const COMPILE_COMMANDS_FILENAME: &str = "compile_commands.json";

#[derive(Debug, Error)]
pub enum FixupError {
    #[error("compile_commands.json not found under {0}")]
    NotFound(PathBuf),
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, #[source] std::io::Error),
}

impl diag::DiagnosableError for FixupError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            FixupError::NotFound(_) => vec![
                "Run the build first, or pass --compile-commands with an explicit path".into(),
            ],
            _ => vec![],
        }
    }
}

fn locate_compile_commands(build_dir: &Path) -> Option<PathBuf> {
    let direct = build_dir.join(COMPILE_COMMANDS_FILENAME);
    if direct.is_file() {
        return Some(direct);
    }
    // Shallow search one level down, which is where out-of-source
    // CMake/Meson builds commonly place it.
    fs::read_dir(build_dir).ok()?.flatten().find_map(|entry| {
        let candidate = entry.path().join(COMPILE_COMMANDS_FILENAME);
        candidate.is_file().then_some(candidate)
    })
}

/// Applies the path-portability filter to the compilation database
/// found under `build_dir`, rewriting it in place. Idempotent, safe to
/// re-run. Returns the number of substitutions performed.
pub fn fix_compile_db(
    build_dir: &Path,
    workspace_root: &Path,
    docker_prefix: &str,
) -> Result<(usize, HilResult), FixupError> {
    let start = Instant::now();
    let path = locate_compile_commands(build_dir)
        .ok_or_else(|| FixupError::NotFound(build_dir.to_path_buf()))?;

    let contents = fs::read_to_string(&path).map_err(|e| FixupError::ReadFailed(path.clone(), e))?;
    let substitutions = pathfix::count_occurrences(&contents, docker_prefix);

    if substitutions > 0 {
        let fixed = pathfix::rewrite_docker_prefix(&contents, docker_prefix, workspace_root);
        fs::write(&path, fixed).map_err(|e| FixupError::WriteFailed(path.clone(), e))?;
    }

    let duration_ms = start.elapsed().as_millis() as u64;
    let detail = if substitutions == 0 {
        "build was native; no substitutions needed".to_string()
    } else {
        format!("rewrote {substitutions} occurrence(s) of {docker_prefix}")
    };

    Ok((
        substitutions,
        HilResult::success("fix_compile_db", duration_ms).with_checks({
            let mut m = std::collections::BTreeMap::new();
            m.insert(
                "rewrite".to_string(),
                crate::result::CheckResult::pass(detail),
            );
            m
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rewrites_in_place_and_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("build");
        fs::create_dir_all(&build_dir).unwrap();
        fs::write(
            build_dir.join(COMPILE_COMMANDS_FILENAME),
            r#"[{"directory":"/workspace","file":"/workspace/main.c","command":"cc /workspace/main.c"}]"#,
        )
        .unwrap();

        let (count, result) =
            fix_compile_db(&build_dir, &dir.path().join("host-root"), "/workspace/").unwrap();
        assert_eq!(count, 3);
        assert_eq!(result.status, crate::result::Status::Success);

        let fixed = fs::read_to_string(build_dir.join(COMPILE_COMMANDS_FILENAME)).unwrap();
        assert!(!fixed.contains("/workspace/"));
    }

    #[test]
    fn native_build_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("build");
        fs::create_dir_all(&build_dir).unwrap();
        fs::write(
            build_dir.join(COMPILE_COMMANDS_FILENAME),
            r#"[{"directory":"/home/dev/proj","file":"/home/dev/proj/main.c"}]"#,
        )
        .unwrap();

        let (count, _) =
            fix_compile_db(&build_dir, &dir.path().join("host-root"), "/workspace/").unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("build");
        fs::create_dir_all(&build_dir).unwrap();
        fs::write(
            build_dir.join(COMPILE_COMMANDS_FILENAME),
            r#"[{"file":"/workspace/main.c"}]"#,
        )
        .unwrap();
        let host_root = dir.path().join("host-root");

        let (first, _) = fix_compile_db(&build_dir, &host_root, "/workspace/").unwrap();
        let (second, _) = fix_compile_db(&build_dir, &host_root, "/workspace/").unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
