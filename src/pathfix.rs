//! Pure path-portability rewrite for a compilation-database document
//! (§4.4). A containerized build mounts the project root at a fixed
//! "docker prefix"; this rewrites that prefix back to the host's
//! project root so host language servers can resolve paths.
use std::path::Path;

pub const DEFAULT_DOCKER_PREFIX: &str = "/workspace/";

/// Rewrites every occurrence of `docker_prefix` in `contents` to
/// `host_root` followed by a path separator. Idempotent: once no
/// occurrence of `docker_prefix` remains, a second pass is a no-op.
pub fn rewrite_docker_prefix(contents: &str, docker_prefix: &str, host_root: &Path) -> String {
    let replacement = format!("{}{}", host_root.display(), std::path::MAIN_SEPARATOR);
    contents.replace(docker_prefix, &replacement)
}

/// Number of occurrences that would be rewritten, without doing the
/// rewrite -- used by the fixup driver (§4.13) to report "0
/// substitutions means the build was native, not containerized".
pub fn count_occurrences(contents: &str, docker_prefix: &str) -> usize {
    contents.matches(docker_prefix).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn rewrites_embedded_path() {
        let input = r#"[{"directory":"/workspace","file":"/workspace/firmware/app/main.c"}]"#;
        let out = rewrite_docker_prefix(input, "/workspace/", &PathBuf::from("/home/dev/proj"));
        assert!(out.contains("/home/dev/proj/firmware/app/main.c"));
        assert!(!out.contains("/workspace/"));
    }

    #[test]
    fn idempotent() {
        let input = r#"{"file":"/workspace/main.c"}"#;
        let root = PathBuf::from("/home/dev/proj");
        let once = rewrite_docker_prefix(input, "/workspace/", &root);
        let twice = rewrite_docker_prefix(&once, "/workspace/", &root);
        assert_eq!(once, twice);
    }

    #[test]
    fn zero_occurrences_on_native_build() {
        let input = r#"{"file":"/home/dev/proj/main.c"}"#;
        assert_eq!(count_occurrences(input, "/workspace/"), 0);
    }
}
