//! Test doubles: scripted compute binaries and an in-memory object store.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vrender_models::{FrameChunk, FrameName, ImageType, JobMessage};
use vrender_storage::{LocalRoots, ObjectStore, Storage, StorageError, StorageResult};

use crate::context::JobContext;
use crate::logging::JobLogger;
use crate::rewrite::Scratch;
use crate::runner::BinaryRunner;

/// Write an executable `<dir>/<name>` shell script.
///
/// It lists `flags` on `--helpshort` (appending to `<name>.help`), otherwise
/// records its arguments one per line in `<name>.args`, its GLOG variables in `<name>.env`,
/// exposes each `--x=v` argument as `$flag_x` and runs `body`.
pub fn fake_binary(dir: &Path, name: &str, flags: &[&str], body: &str) {
    let mut help = String::new();
    for flag in flags {
        help.push_str(&format!("  echo '    -{flag} ({flag}) type: string default: \"\"'\n"));
    }
    let script = format!(
        r#"#!/bin/sh
here="$(dirname "$0")"
if [ "$1" = "--helpshort" ]; then
  echo called >> "$here/{name}.help"
  echo '  Flags from {name}.cpp:'
{help}  exit 1
fi
printf '%s\n' "$@" > "$here/{name}.args"
echo "$GLOG_alsologtostderr $GLOG_stderrthreshold" > "$here/{name}.env"
for arg in "$@"; do
  key="${{arg%%=*}}"
  key="${{key#--}}"
  value="${{arg#*=}}"
  eval "flag_$key=\"\$value\""
done
{body}
"#
    );

    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Arguments of the last run of a fake binary, keyed by flag name.
pub fn recorded_args(dir: &Path, name: &str) -> BTreeMap<String, String> {
    let args = std::fs::read_to_string(dir.join(format!("{name}.args"))).unwrap();
    args.lines()
        .filter_map(|arg| arg.strip_prefix("--"))
        .filter_map(|arg| arg.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn write_file(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn insert(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), data.to_vec());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn get_to_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()> {
        let data = self
            .get(bucket, key)
            .ok_or_else(|| StorageError::not_found(format!("s3://{bucket}/{key}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> StorageResult<()> {
        let data = std::fs::read(path)?;
        self.insert(bucket, key, &data);
        Ok(())
    }

    async fn copy(&self, bucket: &str, src_key: &str, dst_bucket: &str, dst_key: &str) -> StorageResult<()> {
        let data = self
            .get(bucket, src_key)
            .ok_or_else(|| StorageError::not_found(format!("s3://{bucket}/{src_key}")))?;
        self.insert(dst_bucket, dst_key, &data);
        Ok(())
    }
}

/// Job over frames `first..=last` rooted at `root`, outputs under `<root>/output`.
pub fn job(app: &str, first: u32, last: u32, root: &str) -> JobMessage {
    let chunk = FrameChunk::new(FrameName::new(first), FrameName::new(last)).unwrap();
    JobMessage::new(app, &chunk, root, format!("{root}/output"), format!("{root}/rig.json"))
}

fn context(msg: JobMessage, storage: Arc<Storage>, roots: LocalRoots, bin_dir: &Path) -> JobContext {
    let stage = msg.stage().unwrap();
    let logger = JobLogger::new("test", &msg);
    JobContext::new(msg, stage, storage, Arc::new(BinaryRunner::new(bin_dir)), roots, logger)
}

/// Context for a job whose roots are local directories.
pub fn local_context(msg: JobMessage, bin_dir: &Path) -> JobContext {
    let roots = LocalRoots::new(&msg.input_root, &msg.output_root);
    context(msg, Arc::new(Storage::local_only("/mnt")), roots, bin_dir)
}

/// Context for a job whose roots live in `store`, mirrored under `scratch`.
pub fn remote_context(msg: JobMessage, store: Arc<MemoryStore>, scratch: &Scratch, bin_dir: &Path) -> JobContext {
    let storage = Arc::new(Storage::with_object_store("/mnt", store));
    let roots = scratch.roots_for(&storage, &msg).unwrap();
    context(msg, storage, roots, bin_dir)
}

/// Push local files of `image_type` at `level` for `frames` into a remote job's store.
pub async fn seed_remote(
    store: &Arc<MemoryStore>,
    msg: &JobMessage,
    image_type: ImageType,
    level: Option<u32>,
    files: &[(&str, &str)],
    frames: &[FrameName],
) {
    let origin = tempfile::TempDir::new().unwrap();
    let roots = LocalRoots::new(origin.path().join("in"), origin.path().join("out"));
    let dir = roots.image_type_path(image_type, level).unwrap();
    for (relative, contents) in files {
        write_file(&dir.join(relative), contents);
    }
    let storage = Storage::with_object_store("/mnt", store.clone());
    storage
        .upload_image_type(msg, &roots, image_type, Some(frames), level)
        .await
        .unwrap();
}

pub const RIG_JSON: &str = r#"{"cameras": [{"id": "cam0", "resolution": [64, 32]}, {"id": "cam1", "resolution": [64, 32]}]}"#;
