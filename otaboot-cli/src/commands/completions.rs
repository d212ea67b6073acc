//! Shell completion generation and installation.

use {
    crate::Cli,
    anyhow::{Context, Result},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    console::style,
    std::{
        env, fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
    },
};

const BIN_NAME: &str = "otaboot";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), BIN_NAME, &mut io::stdout());
}

/// Detect the user's current shell from environment.
pub(crate) fn detect_shell_type() -> Option<Shell> {
    // Try $SHELL first (Unix)
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }

    // On Windows, try PSModulePath for PowerShell detection
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }

    None
}

/// Parse a shell binary path into its `Shell` enum.
///
/// Extracts the filename from the path and matches known shell names.
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

/// Get the completion script installation path for a given shell.
fn get_completion_install_path(shell: Shell) -> Result<PathBuf> {
    match shell {
        Shell::Bash => Ok(dirs_for_data()
            .join("bash-completion")
            .join("completions")
            .join(BIN_NAME)),
        Shell::Zsh => Ok(home_dir()?
            .join(".zfunc")
            .join(format!("_{BIN_NAME}"))),
        Shell::Fish => Ok(xdg_config_dir()
            .join("fish")
            .join("completions")
            .join(format!("{BIN_NAME}.fish"))),
        Shell::PowerShell => {
            let dir = match env::var("PROFILE") {
                Ok(profile) => PathBuf::from(&profile)
                    .parent()
                    .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
                Err(_) => home_dir()?
                    .join(".config")
                    .join("powershell")
                    .join("completions"),
            };
            Ok(dir.join(format!("{BIN_NAME}.ps1")))
        },
        Shell::Elvish => Ok(xdg_config_dir()
            .join("elvish")
            .join("lib")
            .join(format!("{BIN_NAME}.elv"))),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    }
}

/// Get home directory.
fn home_dir() -> Result<PathBuf> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .context("Could not determine home directory")
}

/// Get XDG config directory (~/.config by default).
fn xdg_config_dir() -> PathBuf {
    env::var("XDG_CONFIG_HOME").map_or_else(
        |_| {
            home_dir()
                .unwrap_or_default()
                .join(".config")
        },
        PathBuf::from,
    )
}

/// Get XDG data directory.
fn dirs_for_data() -> PathBuf {
    env::var("XDG_DATA_HOME").map_or_else(
        |_| {
            home_dir()
                .unwrap_or_default()
                .join(".local")
                .join("share")
        },
        PathBuf::from,
    )
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             otaboot completions --install bash",
        )?,
    };

    let path = get_completion_install_path(shell)?;

    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), BIN_NAME, &mut buf);

    // Create parent directory
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    // Write the completion file
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓")
            .green()
            .bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );

    eprintln!();
    match shell {
        Shell::Bash => eprintln!(
            "Loaded on new terminals. To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => {
            ensure_zsh_fpath()?;
            eprintln!("Restart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => eprintln!(
            "Add to your PowerShell profile: {}",
            style(format!("Import-Module {}", path.display())).cyan()
        ),
        _ => eprintln!("Loaded automatically by new {shell:?} sessions."),
    }

    Ok(())
}

/// Make sure `~/.zfunc` is on zsh's fpath.
fn ensure_zsh_fpath() -> Result<()> {
    const FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

    let zshrc = home_dir()?.join(".zshrc");
    if fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(FPATH_LINE)) {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN_NAME} completions\n{FPATH_LINE}\nautoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}
