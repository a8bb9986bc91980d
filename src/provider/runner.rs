//! CommandRunner seam: ZfsProvider never spawns processes directly.
//!
//! - SystemRunner: std::process::Command, stdout/stderr захватываются.
//! - ScriptedRunner: записывает командные строки и отвечает по префиксным правилам
//!   (первое совпавшее правило; `once` правила расходуются).

use std::process::Command;
use std::sync::{Mutex, PoisonError};

use log::trace;

use super::ProviderError;

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            status: "exit status: 0".to_string(),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            success: false,
            status: format!("exit status: {code}"),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run `program args..` to completion. Err only when the process could not be spawned.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProviderError>;

    /// Like `run`, but a non-zero exit becomes ProviderError::Command.
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<String, ProviderError> {
        let out = self.run(program, args)?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(ProviderError::Command {
                cmd: command_line(program, args),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut s = program.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProviderError> {
        trace!("exec: {}", command_line(program, args));
        let out = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ProviderError::io(format!("spawn {}", program), e))?;
        Ok(CommandOutput {
            success: out.status.success(),
            status: out.status.to_string(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

struct Rule {
    prefix: String,
    output: CommandOutput,
    once: bool,
}

/// Test runner: records every command line, answers from rules, default is success with empty stdout.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    rules: Mutex<Vec<Rule>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command starting with `prefix` answers `output`.
    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.push(prefix, output, false)
    }

    /// The next command starting with `prefix` answers `output`, then the rule is dropped.
    pub fn once(&self, prefix: &str, output: CommandOutput) -> &Self {
        self.push(prefix, output, true)
    }

    fn push(&self, prefix: &str, output: CommandOutput, once: bool) -> &Self {
        let mut g = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        // once-правила приоритетнее постоянных
        let rule = Rule {
            prefix: prefix.to_string(),
            output,
            once,
        };
        if once {
            g.insert(0, rule);
        } else {
            g.push(rule);
        }
        drop(g);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ProviderError> {
        let line = command_line(program, args);
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(line.clone());

        let mut g = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = g.iter().position(|r| line.starts_with(&r.prefix)) {
            let out = g[pos].output.clone();
            if g[pos].once {
                g.remove(pos);
            }
            return Ok(out);
        }
        Ok(CommandOutput::ok(""))
    }
}
