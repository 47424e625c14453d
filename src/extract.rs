//! Archive unpacking through external tools. RAR has no pure-Rust
//! decoder worth depending on, so the run locates the first of `unrar`,
//! `7z`, `7zz` or `bsdtar` on PATH and shells out, the same set of tools
//! the regulator's consumers have always leaned on.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ExtractError, RunError};

const TOOLS: [&str; 4] = ["unrar", "7z", "7zz", "bsdtar"];

/// Hard ceiling on one tool invocation. A hung unpacker counts as a
/// failed date, not a stalled run.
const TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Unpacks one downloaded archive into a directory. A trait seam so tests
/// can plant table files without any archive tool installed.
pub trait Extractor: Send + Sync {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError>;
}

pub struct ToolExtractor {
    program: String,
    timeout: Duration,
}

impl ToolExtractor {
    /// First known unpacker found on PATH; resolved once per run so a
    /// missing tool fails before any download starts.
    pub fn locate() -> Result<ToolExtractor, RunError> {
        for tool in TOOLS.iter() {
            if on_path(tool) {
                debug!(tool, "archive tool selected");
                return Ok(ToolExtractor {
                    program: (*tool).to_owned(),
                    timeout: TOOL_TIMEOUT,
                });
            }
        }
        Err(RunError::NoTool(TOOLS.join(", ")))
    }

    pub fn with_program(program: &str) -> ToolExtractor {
        ToolExtractor {
            program: program.to_owned(),
            timeout: TOOL_TIMEOUT,
        }
    }

    fn command(&self, archive: &Path, dest: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        match self.program.as_str() {
            "unrar" => {
                cmd.arg("x").arg("-o+").arg(archive);
                // the trailing separator tells unrar this is a directory
                let mut dir = OsString::from(dest);
                dir.push("/");
                cmd.arg(dir);
            }
            "bsdtar" => {
                cmd.arg("-xf").arg(archive).arg("-C").arg(dest);
            }
            _ => {
                let mut flag = OsString::from("-o");
                flag.push(dest);
                cmd.arg("x").arg(flag).arg(archive).arg("-y");
            }
        }
        cmd
    }
}

impl Extractor for ToolExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<(), ExtractError> {
        fs::create_dir_all(dest)?;
        // tool output goes to files so a chatty unpacker cannot fill a pipe
        let out_log = dest.join(".unpack.out");
        let err_log = dest.join(".unpack.err");
        let result = self.run_tool(archive, dest, &out_log, &err_log);
        let _ = fs::remove_file(&out_log);
        let _ = fs::remove_file(&err_log);
        result?;
        confine_to(dest)
    }
}

impl ToolExtractor {
    fn run_tool(
        &self,
        archive: &Path,
        dest: &Path,
        out_log: &Path,
        err_log: &Path,
    ) -> Result<(), ExtractError> {
        let mut cmd = self.command(archive, dest);
        cmd.stdin(Stdio::null())
            .stdout(File::create(out_log)?)
            .stderr(File::create(err_log)?);
        let mut child = cmd.spawn()?;
        let status = match wait_bounded(&mut child, self.timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExtractError::TimedOut {
                    tool: self.program.clone(),
                    limit_secs: self.timeout.as_secs(),
                });
            }
        };
        if !status.success() {
            let stderr = read_clipped(err_log);
            let detail = if stderr.is_empty() {
                read_clipped(out_log)
            } else {
                stderr
            };
            return Err(ExtractError::ToolFailed {
                tool: self.program.clone(),
                status: status.code().unwrap_or(-1),
                detail,
            });
        }
        Ok(())
    }
}

fn wait_bounded(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// First 400 chars of a tool log, lossily decoded.
fn read_clipped(path: &Path) -> String {
    let bytes = fs::read(path).unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim().chars().take(400).collect()
}

fn on_path(program: &str) -> bool {
    let path = match std::env::var_os("PATH") {
        Some(p) => p,
        None => return false,
    };
    std::env::split_paths(&path).any(|dir| dir.join(program).is_file())
}

/// Rejects anything the tool wrote that resolves outside `dest`, which
/// covers `..` path components and symlinks pointing out of the tree.
fn confine_to(dest: &Path) -> Result<(), ExtractError> {
    let root = dest.canonicalize()?;
    for entry in WalkDir::new(dest) {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let resolved = match path.canonicalize() {
            Ok(p) => p,
            Err(_) => return Err(ExtractError::UnsafeEntry(path.display().to_string())),
        };
        if !resolved.starts_with(&root) {
            return Err(ExtractError::UnsafeEntry(path.display().to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn unrar_invocation_overwrites_into_the_directory() {
        let tool = ToolExtractor::with_program("unrar");
        let cmd = tool.command(Path::new("/tmp/a.rar"), Path::new("/tmp/out"));
        assert_eq!(cmd.get_program(), "unrar");
        assert_eq!(args_of(&cmd), vec!["x", "-o+", "/tmp/a.rar", "/tmp/out/"]);
    }

    #[test]
    fn seven_zip_invocation_uses_the_output_flag() {
        let tool = ToolExtractor::with_program("7zz");
        let cmd = tool.command(Path::new("/tmp/a.rar"), Path::new("/tmp/out"));
        assert_eq!(args_of(&cmd), vec!["x", "-o/tmp/out", "/tmp/a.rar", "-y"]);
    }

    #[test]
    fn bsdtar_invocation_changes_directory() {
        let tool = ToolExtractor::with_program("bsdtar");
        let cmd = tool.command(Path::new("/tmp/a.rar"), Path::new("/tmp/out"));
        assert_eq!(args_of(&cmd), vec!["-xf", "/tmp/a.rar", "-C", "/tmp/out"]);
    }

    #[test]
    fn failing_tools_surface_their_exit_status() {
        let dir = tempdir().unwrap();
        let tool = ToolExtractor::with_program("false");
        match tool.extract(Path::new("/tmp/a.rar"), dir.path()) {
            Err(ExtractError::ToolFailed { tool, status, .. }) => {
                assert_eq!(tool, "false");
                assert_eq!(status, 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn missing_tools_surface_as_io_errors() {
        let dir = tempdir().unwrap();
        let tool = ToolExtractor::with_program("no-such-unpacker-zz");
        match tool.extract(Path::new("/tmp/a.rar"), dir.path()) {
            Err(ExtractError::Io(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn quick_tools_finish_inside_the_deadline() {
        let mut child = Command::new("true").stdin(Stdio::null()).spawn().unwrap();
        let status = wait_bounded(&mut child, Duration::from_secs(5)).unwrap();
        assert!(status.unwrap().success());
    }

    #[cfg(unix)]
    #[test]
    fn stuck_tools_hit_the_deadline_and_get_killed() {
        let mut child = Command::new("sleep")
            .arg("5")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        let status = wait_bounded(&mut child, Duration::from_millis(120)).unwrap();
        assert!(status.is_none());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn plain_trees_pass_the_confinement_scan() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ex/sub")).unwrap();
        fs::write(dir.path().join("ex/sub/a.dbf"), b"x").unwrap();
        confine_to(&dir.path().join("ex")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn escaping_symlinks_are_rejected() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("ex");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dir.path().join("outside.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("outside.txt"), dest.join("link")).unwrap();
        match confine_to(&dest) {
            Err(ExtractError::UnsafeEntry(path)) => assert!(path.contains("link")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
