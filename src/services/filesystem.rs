//! File and filesystem-freeze operations: stat, hashing, ownership/mode,
//! directory creation, chunked upload/download, and the freeze/thaw/sync
//! trio that backs `fsfreeze`-style guest quiescing.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};

use agent_proto::filesystem_server::Filesystem;
use agent_proto::{
    CreateDirRequest, DownloadChunk, DownloadRequest, FileMD5Request, FileMD5Response,
    FileStatRequest, FileStatResponse, SetFileModeRequest, SetFileOwnerRequest, UploadChunk,
};

use crate::config::{DOWNLOAD_CHUNK_BYTES, MAX_UPLOAD_BYTES};
use crate::error::{Error, Result};
use crate::server::ServerState;

pub struct FilesystemService {
    state: Arc<ServerState>,
}

impl FilesystemService {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }
}

/// A line whose first field is empty or starts with `+`/`-` is a NIS
/// include/exclude directive, not a real account; skip it rather than
/// matching it as a name or id.
fn is_nis_directive(first_field: &str) -> bool {
    first_field.is_empty() || first_field.starts_with('+') || first_field.starts_with('-')
}

fn passwd_lookup_name(uid: u32) -> Result<Option<String>> {
    let file = std::fs::File::open("/etc/passwd")?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 || is_nis_directive(fields[0]) {
            continue;
        }
        let line_uid: u32 = fields[2]
            .parse()
            .map_err(|_| Error::Internal(format!("malformed uid field in /etc/passwd: {}", fields[2])))?;
        if line_uid == uid {
            return Ok(Some(fields[0].to_string()));
        }
    }
    Ok(None)
}

fn passwd_lookup_uid(name: &str) -> Result<Option<u32>> {
    let file = std::fs::File::open("/etc/passwd")?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 || is_nis_directive(fields[0]) {
            continue;
        }
        if fields[0] == name {
            let uid: u32 = fields[2]
                .parse()
                .map_err(|_| Error::Internal(format!("malformed uid field in /etc/passwd: {}", fields[2])))?;
            return Ok(Some(uid));
        }
    }
    Ok(None)
}

fn group_lookup_name(gid: u32) -> Result<Option<String>> {
    let file = std::fs::File::open("/etc/group")?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 || is_nis_directive(fields[0]) {
            continue;
        }
        let line_gid: u32 = fields[2]
            .parse()
            .map_err(|_| Error::Internal(format!("malformed gid field in /etc/group: {}", fields[2])))?;
        if line_gid == gid {
            return Ok(Some(fields[0].to_string()));
        }
    }
    Ok(None)
}

fn group_lookup_gid(name: &str) -> Result<Option<u32>> {
    let file = std::fs::File::open("/etc/group")?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 || is_nis_directive(fields[0]) {
            continue;
        }
        if fields[0] == name {
            let gid: u32 = fields[2]
                .parse()
                .map_err(|_| Error::Internal(format!("malformed gid field in /etc/group: {}", fields[2])))?;
            return Ok(Some(gid));
        }
    }
    Ok(None)
}

fn stat_response(path: &Path) -> Result<FileStatResponse> {
    let meta = std::fs::symlink_metadata(path)?;
    use std::os::unix::fs::MetadataExt;

    let uid = meta.uid();
    let gid = meta.gid();
    let owner = passwd_lookup_name(uid)?.unwrap_or_else(|| uid.to_string());
    let group = group_lookup_name(gid)?.unwrap_or_else(|| gid.to_string());
    let modified_at = meta.modified().ok().map(prost_types::Timestamp::from);

    Ok(FileStatResponse {
        path: path.display().to_string(),
        size_bytes: meta.len(),
        mode: meta.mode() & 0o7777,
        owner,
        group,
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
        modified_at,
        dir_entries: Vec::new(),
    })
}

fn create_dir_with_mode(path: &Path, mode: u32, parents: bool) -> Result<()> {
    if parents {
        std::fs::create_dir_all(path)?;
    } else {
        std::fs::create_dir(path)?;
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

#[tonic::async_trait]
impl Filesystem for FilesystemService {
    async fn get_file_stat(&self, request: Request<FileStatRequest>) -> Result<Response<FileStatResponse>, Status> {
        let req = request.into_inner();
        let path = PathBuf::from(&req.path);
        let mut response = stat_response(&path)?;

        if response.is_dir && req.with_dir_content {
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                entries.push(entry.file_name().to_string_lossy().into_owned());
            }
            entries.sort();
            response.dir_entries = entries;
        }

        Ok(Response::new(response))
    }

    async fn get_file_md5_hash(&self, request: Request<FileMD5Request>) -> Result<Response<FileMD5Response>, Status> {
        let path = request.into_inner().path;
        let mut file = std::fs::File::open(&path)?;
        let mut ctx = md5::Context::new();
        let mut buf = [0u8; 65536];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
        }
        let digest = ctx.compute();
        Ok(Response::new(FileMD5Response {
            hex_digest: format!("{digest:x}"),
        }))
    }

    async fn set_file_owner(&self, request: Request<SetFileOwnerRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        let uid = match req.owner.parse::<u32>() {
            Ok(uid) => uid,
            Err(_) => passwd_lookup_uid(&req.owner)?
                .ok_or_else(|| Error::InvalidArgument(format!("invalid user name/uid: {}", req.owner)))?,
        };
        let gid = match req.group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => group_lookup_gid(&req.group)?
                .ok_or_else(|| Error::InvalidArgument(format!("invalid group name/gid: {}", req.group)))?,
        };

        nix::unistd::chown(
            req.path.as_str(),
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(|e| Error::Internal(format!("chown {}: {e}", req.path)))?;
        Ok(Response::new(()))
    }

    async fn set_file_mode(&self, request: Request<SetFileModeRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        let perms = std::fs::Permissions::from_mode(req.mode & 0o7777);
        std::fs::set_permissions(&req.path, perms)?;
        Ok(Response::new(()))
    }

    async fn create_dir(&self, request: Request<CreateDirRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        let path = PathBuf::from(&req.path);

        // Cleared so a recursive mkdir's intermediate directories land at
        // exactly the requested mode instead of umask-masked.
        let old_mask = nix::sys::stat::umask(nix::sys::stat::Mode::empty());
        let result = create_dir_with_mode(&path, req.mode, req.parents);
        nix::sys::stat::umask(old_mask);
        result?;

        Ok(Response::new(()))
    }

    async fn upload_file(&self, request: Request<Streaming<UploadChunk>>) -> Result<Response<()>, Status> {
        self.state.freeze.admit("/agent.v1.Filesystem/UploadFile", true)?;

        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Error::InvalidArgument("empty upload stream".to_string()))?;
        let dest_path = first.dest_path;
        if dest_path.is_empty() {
            return Err(Error::InvalidArgument("file name is undefined".to_string()).into());
        }

        let dest = PathBuf::from(&dest_path);
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let file_name = dest
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("invalid destination path: {dest_path}")))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", file_name.to_string_lossy()))
            .tempfile_in(dir)?;

        let mut total: u64 = first.data.len() as u64;
        if total > MAX_UPLOAD_BYTES {
            return Err(Error::InvalidArgument(format!(
                "file is too large: {total} > {MAX_UPLOAD_BYTES}"
            ))
            .into());
        }
        tmp.write_all(&first.data)?;

        while let Some(chunk) = stream.message().await? {
            total += chunk.data.len() as u64;
            if total > MAX_UPLOAD_BYTES {
                return Err(Error::InvalidArgument(format!(
                    "file is too large: {total} > {MAX_UPLOAD_BYTES}"
                ))
                .into());
            }
            tmp.write_all(&chunk.data)?;
        }

        tmp.as_file().sync_all()?;
        tmp.persist(&dest)
            .map_err(|e| Error::Internal(format!("rename temp file failed: {e}")))?;

        Ok(Response::new(()))
    }

    type DownloadFileStream = Pin<Box<dyn Stream<Item = Result<DownloadChunk, Status>> + Send + 'static>>;

    async fn download_file(
        &self,
        request: Request<DownloadRequest>,
    ) -> Result<Response<Self::DownloadFileStream>, Status> {
        self.state.freeze.admit("/agent.v1.Filesystem/DownloadFile", true)?;

        let path = request.into_inner().path;
        let file = std::fs::File::open(&path)?;

        let stream = async_stream::stream! {
            let mut file = file;
            let mut buf = vec![0u8; DOWNLOAD_CHUNK_BYTES];
            loop {
                let n = match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        yield Err(Status::internal(format!("chunk read failed: {e}")));
                        break;
                    }
                };
                yield Ok(DownloadChunk { data: buf[..n].to_vec() });
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }

    async fn freeze(&self, _request: Request<()>) -> Result<Response<()>, Status> {
        self.state.freeze.freeze()?;
        Ok(Response::new(()))
    }

    async fn unfreeze(&self, _request: Request<()>) -> Result<Response<()>, Status> {
        self.state.freeze.unfreeze()?;
        Ok(Response::new(()))
    }

    async fn sync(&self, _request: Request<()>) -> Result<Response<()>, Status> {
        // SAFETY: sync(2) takes no arguments and cannot fail in a way the
        // caller can act on.
        unsafe { libc::sync() };
        Ok(Response::new(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwd_lookup_roundtrips_root() {
        assert_eq!(passwd_lookup_name(0).unwrap().as_deref(), Some("root"));
        assert_eq!(passwd_lookup_uid("root").unwrap(), Some(0));
    }

    #[test]
    fn passwd_lookup_unknown_uid_is_none() {
        assert_eq!(passwd_lookup_name(u32::MAX).unwrap(), None);
        assert_eq!(passwd_lookup_uid("no-such-user-abcxyz").unwrap(), None);
    }

    #[test]
    fn group_lookup_roundtrips_root() {
        assert_eq!(group_lookup_name(0).unwrap().as_deref(), Some("root"));
        assert_eq!(group_lookup_gid("root").unwrap(), Some(0));
    }

    #[test]
    fn nis_directive_lines_are_skipped() {
        assert!(is_nis_directive(""));
        assert!(is_nis_directive("+"));
        assert!(is_nis_directive("-@somegroup"));
        assert!(!is_nis_directive("root"));
    }

    #[test]
    fn stat_response_reports_regular_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"hello").unwrap();
        let resp = stat_response(tmp.path()).unwrap();
        assert_eq!(resp.size_bytes, 5);
        assert!(!resp.is_dir);
        assert!(!resp.is_symlink);
    }

    #[test]
    fn stat_response_reports_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resp = stat_response(dir.path()).unwrap();
        assert!(resp.is_dir);
        assert!(resp.dir_entries.is_empty());
    }
}
