// Keystone Tool Server — Shell Capability
// Commands are tokenized with a proper shell splitter, never string-glued.
// shell=true runs through `sh -c` and therefore requires the first token
// to sit on the whitelist; shell=false execs the tokens directly. Both
// paths run under a timeout with captured output.

use crate::atoms::error::{EngineError, EngineResult};
use log::info;
use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct ShellOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

const OUTPUT_CAP: usize = 64 * 1024;

pub async fn run_shell(
    command: &str,
    shell: bool,
    whitelist: &[String],
    timeout: Duration,
) -> EngineResult<ShellOutcome> {
    let tokens = shell_words::split(command)
        .map_err(|e| EngineError::tool("run_shell", format!("unparseable command: {e}")))?;
    let Some(first) = tokens.first() else {
        return Err(EngineError::tool("run_shell", "empty command"));
    };

    let mut cmd = if shell {
        // Through a shell, only the leading program is checkable, so it
        // must be whitelisted.
        if !whitelist.iter().any(|w| w == first) {
            return Err(EngineError::Security(format!(
                "'{first}' is not on the shell whitelist"
            )));
        }
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    } else {
        let mut c = Command::new(first);
        c.args(&tokens[1..]);
        c
    };
    cmd.kill_on_drop(true);

    info!("[tools] run_shell shell={} '{}'", shell, command);
    let output = tokio::time::timeout(timeout, cmd.output()).await;
    match output {
        Ok(Ok(out)) => Ok(ShellOutcome {
            stdout: truncate(&String::from_utf8_lossy(&out.stdout)),
            stderr: truncate(&String::from_utf8_lossy(&out.stderr)),
            exit_code: out.status.code().unwrap_or(-1),
            timed_out: false,
        }),
        Ok(Err(e)) => Err(EngineError::tool("run_shell", format!("spawn failed: {e}"))),
        Err(_) => Ok(ShellOutcome {
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
            exit_code: -1,
            timed_out: true,
        }),
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= OUTPUT_CAP {
        return s.to_string();
    }
    // The cap is a byte count; walk back to a char boundary so multibyte
    // output can't panic the slice.
    let mut cut = OUTPUT_CAP;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated]", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> Vec<String> {
        vec!["echo".to_string(), "ls".to_string()]
    }

    #[tokio::test]
    async fn test_direct_exec() {
        let out = run_shell("echo hello world", false, &whitelist(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello world");
        assert_eq!(out.exit_code, 0);
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn test_tokenizer_handles_quotes() {
        let out = run_shell(r#"echo "two words""#, false, &whitelist(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "two words");
    }

    #[tokio::test]
    async fn test_shell_mode_requires_whitelist() {
        let err = run_shell("rm -rf /tmp/x", true, &whitelist(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Security(_)));

        // Whitelisted leading token passes through sh -c
        let out = run_shell("echo a | tr a b", true, &whitelist(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "b");
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let out = run_shell("sleep 5", false, &whitelist(), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, -1);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        assert!(run_shell("   ", false, &whitelist(), Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // 3-byte chars: the cap (64 KiB) is not divisible by 3, so a naive
        // byte slice would land mid-codepoint and panic.
        let big = "→".repeat(OUTPUT_CAP / 3 + 100);
        assert!(big.len() > OUTPUT_CAP);
        let out = truncate(&big);
        assert!(out.ends_with("…[truncated]"));
        assert!(out.trim_end_matches("…[truncated]").chars().all(|c| c == '→'));

        // Under the cap: untouched
        assert_eq!(truncate("short"), "short");
    }
}
