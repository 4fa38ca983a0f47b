//! External compute binary runner.
//!
//! Each binary describes its own flags through `--helpshort`. The listing is
//! read once per binary and cached for the life of the worker; a job's
//! parameters are passed as `--name=value` only for the flags the binary
//! declares.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;

const HELP_FLAG: &str = "--helpshort";
const FLAG_LINE: &str = r"(?m)^\s+-([A-Za-z0-9_]+) \(";

/// Flag names listed in a `--helpshort` dump.
pub fn parse_declared_flags(help: &str) -> WorkerResult<BTreeSet<String>> {
    let pattern = Regex::new(FLAG_LINE).map_err(|e| WorkerError::config_error(e.to_string()))?;
    Ok(pattern
        .captures_iter(help)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect())
}

/// `--name=value` for every declared flag with a non-empty value.
pub fn command_args(declared: &BTreeSet<String>, flags: &BTreeMap<String, String>) -> Vec<String> {
    declared
        .iter()
        .filter_map(|name| {
            flags
                .get(name)
                .filter(|value| !value.is_empty())
                .map(|value| format!("--{name}={value}"))
        })
        .collect()
}

/// Runs binaries from one directory, caching their declared flags.
#[derive(Debug)]
pub struct BinaryRunner {
    bin_dir: PathBuf,
    declared: Mutex<HashMap<String, Arc<BTreeSet<String>>>>,
}

impl BinaryRunner {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            declared: Mutex::new(HashMap::new()),
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn binary_path(&self, binary: &str) -> WorkerResult<PathBuf> {
        let path = self.bin_dir.join(binary);
        if path.is_file() {
            Ok(path)
        } else {
            Err(WorkerError::BinaryNotFound(path.display().to_string()))
        }
    }

    fn cached(&self, binary: &str) -> Option<Arc<BTreeSet<String>>> {
        self.declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(binary)
            .cloned()
    }

    /// Flags `binary` accepts.
    pub async fn declared_flags(&self, binary: &str) -> WorkerResult<Arc<BTreeSet<String>>> {
        if let Some(flags) = self.cached(binary) {
            return Ok(flags);
        }

        let path = self.binary_path(binary)?;
        // gflags exits non-zero after printing help, so the status is ignored
        let output = Command::new(&path)
            .arg(HELP_FLAG)
            .stdin(Stdio::null())
            .output()
            .await?;
        let mut help = String::from_utf8_lossy(&output.stdout).into_owned();
        help.push_str(&String::from_utf8_lossy(&output.stderr));

        let flags = Arc::new(parse_declared_flags(&help)?);
        if flags.is_empty() {
            warn!(binary, "Binary declared no flags");
        }
        debug!(binary, flags = flags.len(), "Introspected binary flags");

        self.declared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(binary.to_string(), Arc::clone(&flags));
        Ok(flags)
    }

    /// Run `binary` with the declared subset of `flags` and wait for it.
    pub async fn run(&self, binary: &str, flags: &BTreeMap<String, String>) -> WorkerResult<()> {
        let declared = self.declared_flags(binary).await?;
        let path = self.binary_path(binary)?;
        let args = command_args(&declared, flags);
        info!(binary, "Running {} {}", path.display(), args.join(" "));

        let started = Instant::now();
        let mut child = Command::new(&path)
            .args(&args)
            .env("GLOG_alsologtostderr", "1")
            .env("GLOG_stderrthreshold", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let forwarders: Vec<_> = [
            child.stdout.take().map(|s| forward_lines(binary, s)),
            child.stderr.take().map(|s| forward_lines(binary, s)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = child.wait().await?;
        for forwarder in forwarders {
            let _ = forwarder.await;
        }
        metrics::record_binary_duration(binary, started.elapsed().as_secs_f64());

        if status.success() {
            Ok(())
        } else {
            Err(WorkerError::BinaryFailed {
                binary: binary.to_string(),
                status: status.to_string(),
            })
        }
    }
}

fn forward_lines<R>(binary: &str, stream: R) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let binary = binary.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(binary = %binary, "{}", line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_binary;
    use tempfile::TempDir;

    const HELP: &str = "  Flags from source/depth_estimation/DerpCLI.cpp:
    -color (Path to color levels) type: string default: \"\"
    -first (First frame to process) type: string default: \"\"
    -threshold (Mask threshold) type: int32 default: 0
  Flags from gflags_reporting.cc:
    -helpshort (show help on only the main module) type: bool default: false
";

    #[test]
    fn test_parse_declared_flags() {
        let flags = parse_declared_flags(HELP).unwrap();
        let names: Vec<&str> = flags.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["color", "first", "helpshort", "threshold"]);
    }

    #[test]
    fn test_command_args_skip_undeclared_and_empty() {
        let declared: BTreeSet<String> = ["color", "first", "disparity"].iter().map(|s| s.to_string()).collect();
        let flags = BTreeMap::from([
            ("color".to_string(), "/in/color".to_string()),
            ("first".to_string(), "000001".to_string()),
            ("disparity".to_string(), String::new()),
            ("app".to_string(), "DerpCLI".to_string()),
        ]);
        assert_eq!(
            command_args(&declared, &flags),
            vec!["--color=/in/color".to_string(), "--first=000001".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_passes_declared_flags_and_glog_env() {
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), "Fake", &["color", "first"], "exit 0");
        let runner = BinaryRunner::new(bin.path());

        let flags = BTreeMap::from([
            ("color".to_string(), "/in/color".to_string()),
            ("first".to_string(), "000004".to_string()),
            ("last".to_string(), "000009".to_string()),
        ]);
        runner.run("Fake", &flags).await.unwrap();

        let args = std::fs::read_to_string(bin.path().join("Fake.args")).unwrap();
        assert_eq!(args.lines().collect::<Vec<_>>(), vec!["--color=/in/color", "--first=000004"]);
        let env = std::fs::read_to_string(bin.path().join("Fake.env")).unwrap();
        assert_eq!(env.trim(), "1 0");
    }

    #[tokio::test]
    async fn test_flags_are_introspected_once() {
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), "Fake", &["first"], "exit 0");
        let runner = BinaryRunner::new(bin.path());

        tokio_test::assert_ok!(runner.run("Fake", &BTreeMap::new()).await);
        tokio_test::assert_ok!(runner.run("Fake", &BTreeMap::new()).await);

        let helps = std::fs::read_to_string(bin.path().join("Fake.help")).unwrap();
        assert_eq!(helps.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_non_zero_exit_and_missing_binary_fail() {
        let bin = TempDir::new().unwrap();
        fake_binary(bin.path(), "Broken", &["first"], "exit 3");
        let runner = BinaryRunner::new(bin.path());

        let err = runner.run("Broken", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::BinaryFailed { ref binary, .. } if binary == "Broken"), "{err}");

        let err = runner.run("Missing", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::BinaryNotFound(_)), "{err}");
    }
}
