//! Argument parsing.
//!
//! `--rsh` opens a nested, differently-shaped sub-grammar (rsh's own flags, then a host argument
//! to discard, then the remaining words become the command to run) that doesn't fit alongside
//! `clap`'s flat flag model. We strip it out by hand before handing the rest to `clap`, the same
//! two-phase shape the client this was modeled on uses (`getopt`, then a separate `--rsh` branch).

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser, Debug, PartialEq, Eq)]
#[clap(name = "wsh", about = "run a command inside a container via its daemon")]
pub struct Cli {
    /// Path to socket
    #[clap(long)]
    pub socket: Option<String>,

    /// User to change to
    #[clap(long)]
    pub user: Option<String>,

    /// Environment variables to set for the command. May be repeated.
    #[clap(long = "env")]
    pub env: Vec<String>,

    /// Working directory for the running process
    #[clap(long)]
    pub dir: Option<String>,

    /// File to save the container-namespaced pid of the spawned process to
    #[clap(long)]
    pub pidfile: Option<String>,

    /// Command and arguments to run
    #[clap(trailing_var_arg = true)]
    pub command: Vec<String>,
}

/// Parses `args` (not including argv[0]), handling a leading `--rsh ... host` prefix by hand and
/// everything else through `clap`. Returns `Ok(None)` for `-h`/`--help` (clap already printed
/// usage in that case); `Err` for any other parse failure (clap has already printed its own
/// diagnostic to stderr).
pub fn parse(args: &[String]) -> Result<Option<Cli>> {
    let args = match strip_rsh(args)? {
        Some(args) => args,
        None => args.to_vec(),
    };

    let mut full = vec!["wsh".to_string()];
    full.extend(args);

    match Cli::try_parse_from(&full) {
        Ok(cli) => Ok(Some(cli)),
        Err(e) if e.kind() == clap::ErrorKind::DisplayHelp || e.kind() == clap::ErrorKind::DisplayVersion => {
            eprint!("{e}");
            Ok(None)
        }
        Err(e) => {
            eprint!("{e}");
            Err(anyhow::anyhow!("invalid arguments"))
        }
    }
}

/// If `args` starts with `--rsh`, consumes the `rsh [-46dn] [-l user] [-t timeout] host` prefix
/// and returns the rest of the arguments with a synthesized `--user` prepended when `-l` appeared.
/// Returns `None` when there is no leading `--rsh` to strip.
fn strip_rsh(args: &[String]) -> Result<Option<Vec<String>>> {
    if args.first().map(String::as_str) != Some("--rsh") {
        return Ok(None);
    }

    let mut i = 1;
    let mut user = None;
    while i < args.len() {
        let arg = &args[i];
        if !arg.starts_with('-') {
            break;
        }

        if arg.len() == 2 && "46dn".contains(arg.as_bytes()[1] as char) {
            i += 1;
        } else if arg.len() == 2 && arg.as_bytes()[1] == b'l' {
            user = Some(args.get(i + 1).cloned().context("--rsh -l requires a username")?);
            i += 2;
        } else if arg.len() == 2 && arg.as_bytes()[1] == b't' {
            i += 2;
        } else {
            anyhow::bail!("invalid --rsh option: {arg}");
        }
    }

    anyhow::ensure!(i < args.len(), "--rsh requires a host argument");
    i += 1; // skip over host

    let mut rest = Vec::new();
    if let Some(user) = user {
        rest.push("--user".to_string());
        rest.push(user);
    }
    rest.extend_from_slice(&args[i..]);
    Ok(Some(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags_and_command() {
        let args = argv(&["--socket", "/tmp/d.sock", "--user", "alice", "echo", "hi"]);
        let cli = parse(&args).unwrap().unwrap();
        assert_eq!(cli.socket.as_deref(), Some("/tmp/d.sock"));
        assert_eq!(cli.user.as_deref(), Some("alice"));
        assert_eq!(cli.command, vec!["echo", "hi"]);
    }

    #[test]
    fn help_returns_none() {
        let args = argv(&["--help"]);
        assert!(parse(&args).unwrap().is_none());
    }

    #[test]
    fn rsh_grammar_strips_flags_and_host() {
        let args = argv(&["--rsh", "-l", "bob", "-t", "5", "host", "echo", "hi"]);
        let cli = parse(&args).unwrap().unwrap();
        assert_eq!(cli.user.as_deref(), Some("bob"));
        assert_eq!(cli.command, vec!["echo", "hi"]);
    }

    #[test]
    fn multiple_env_args_collected() {
        let args = argv(&["--env", "A=1", "--env", "B=2", "echo"]);
        let cli = parse(&args).unwrap().unwrap();
        assert_eq!(cli.env, vec!["A=1", "B=2"]);
    }

    #[test]
    fn invalid_option_is_an_error() {
        let args = argv(&["--bogus"]);
        assert!(parse(&args).is_err());
    }
}
