// CLI binary path resolution for the agent tool

use std::path::{Path, PathBuf};

/// Supplies a runnable path for the configured command
pub trait CommandResolver: Send + Sync {
    fn resolve(&self, command: &str) -> Option<PathBuf>;
}

pub struct CliPathResolver;

impl CliPathResolver {
    /// Install locations checked for a given tool before `PATH`
    fn extra_paths(name: &str) -> Vec<Option<PathBuf>> {
        match name {
            "opencode" => vec![dirs::home_dir().map(|h| h.join(".opencode/bin/opencode"))],
            "claude" => vec![dirs::home_dir().map(|h| h.join(".claude/local/claude"))],
            "cursor-agent" => vec![dirs::home_dir().map(|h| h.join(".cursor/bin/cursor-agent"))],
            _ => Vec::new(),
        }
    }

    /// Resolve a CLI binary by checking common paths then falling back to `PATH`
    pub fn resolve_cli(name: &str) -> Option<PathBuf> {
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            return candidate.exists().then(|| candidate.to_path_buf());
        }

        let standard_paths = [
            dirs::home_dir().map(|h| h.join(format!(".npm-global/bin/{}", name))),
            Some(PathBuf::from(format!("/usr/local/bin/{}", name))),
            Some(PathBuf::from(format!("/opt/homebrew/bin/{}", name))),
        ];

        let extra = Self::extra_paths(name);
        for path in extra.iter().chain(standard_paths.iter()).flatten() {
            if path.exists() {
                log::info!("[CliPathResolver] Found {} at: {:?}", name, path);
                return Some(path.clone());
            }
        }

        Self::which(name)
    }

    fn which(cmd: &str) -> Option<PathBuf> {
        match which::which(cmd) {
            Ok(path) => {
                log::info!("[CliPathResolver] Found {} in PATH at: {:?}", cmd, path);
                Some(path)
            }
            Err(_) => None,
        }
    }

    /// Installation hint shown when a tool is missing
    pub fn install_hint(name: &str) -> String {
        match name {
            "opencode" => "Install it with `npm install -g opencode-ai` or see https://opencode.ai".to_string(),
            "claude" => "Install it with `npm install -g @anthropic-ai/claude-code`".to_string(),
            other => format!("Make sure `{}` is installed and on your PATH", other),
        }
    }
}

impl CommandResolver for CliPathResolver {
    fn resolve(&self, command: &str) -> Option<PathBuf> {
        Self::resolve_cli(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_which_finds_common_binary() {
        // `sh` exists on every unix system
        if cfg!(unix) {
            let path = CliPathResolver.resolve("sh").unwrap();
            assert!(path.exists());
        }
    }

    #[test]
    fn test_missing_binary_is_none() {
        assert!(CliPathResolver
            .resolve("this-command-definitely-does-not-exist-12345")
            .is_none());
    }

    #[test]
    fn test_explicit_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let bin = dir.path().join("agent");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();

        assert_eq!(CliPathResolver.resolve(bin.to_str().unwrap()), Some(bin.clone()));
        assert!(CliPathResolver
            .resolve(dir.path().join("missing").to_str().unwrap())
            .is_none());
    }

    #[test]
    fn test_install_hint() {
        assert!(CliPathResolver::install_hint("opencode").contains("opencode"));
        assert!(CliPathResolver::install_hint("foo").contains("`foo`"));
    }
}
