//! Shell completion generation and installation.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN: &str = "groundlink";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN, &mut io::stdout());
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let shell_name = Path::new(shell_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    match shell_name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where the completion script for `shell` goes under `dirs`.
fn completion_install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_local_dir()
            .join("bash-completion")
            .join("completions")
            .join(BIN),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish")
            .join("completions")
            .join(format!("{BIN}.fish")),
        Shell::PowerShell => dirs
            .config_dir()
            .join("powershell")
            .join("completions")
            .join(format!("{BIN}.ps1")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish")
            .join("lib")
            .join(format!("{BIN}.elv")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

fn post_install_hint(shell: Shell, path: &Path) -> String {
    match shell {
        Shell::Bash => format!("Loaded on new terminals. To activate now: source {}", path.display()),
        Shell::Zsh => "Make sure ~/.zfunc is on fpath: fpath=(~/.zfunc $fpath); autoload -Uz compinit && compinit"
            .to_string(),
        Shell::PowerShell => format!("Add to your profile: Import-Module {}", path.display()),
        _ => "Loaded automatically on new sessions.".to_string(),
    }
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             groundlink completions --install bash",
        )?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = completion_install_path(shell, &dirs)?;

    let mut buf = Vec::new();
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, BIN, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );
    eprintln!("{}", post_install_hint(shell, &path));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_from_path() {
        assert_eq!(shell_from_path("/bin/bash"), Some(Shell::Bash));
        assert_eq!(shell_from_path("/usr/bin/zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/local/bin/fish"), Some(Shell::Fish));
        assert_eq!(shell_from_path("/usr/bin/elvish"), Some(Shell::Elvish));
        assert_eq!(shell_from_path("/usr/bin/pwsh"), Some(Shell::PowerShell));
        assert_eq!(shell_from_path("zsh"), Some(Shell::Zsh));
        assert_eq!(shell_from_path("/usr/bin/tcsh"), None);
        assert_eq!(shell_from_path(""), None);
    }

    #[test]
    fn test_install_paths() {
        let Some(dirs) = BaseDirs::new() else {
            return;
        };
        let bash = completion_install_path(Shell::Bash, &dirs).unwrap();
        assert!(bash.to_string_lossy().contains("bash-completion"));
        assert!(bash.ends_with(BIN));

        let zsh = completion_install_path(Shell::Zsh, &dirs).unwrap();
        assert!(zsh.ends_with("_groundlink"));

        let fish = completion_install_path(Shell::Fish, &dirs).unwrap();
        assert!(fish.ends_with("groundlink.fish"));
    }

    #[test]
    fn test_generated_script_names_binary() {
        for shell in [Shell::Bash, Shell::Zsh, Shell::Fish] {
            let mut buf = Vec::new();
            generate(shell, &mut Cli::command(), BIN, &mut buf);
            let output = String::from_utf8(buf).unwrap();
            assert!(output.contains(BIN));
        }
    }
}
