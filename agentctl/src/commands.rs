//! RPC command implementations. Each function dials the already-connected
//! channel, issues one (or one streaming) call, and prints the result as
//! indented JSON.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt as _;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tonic::transport::Channel;

use agent_proto::agent_client::AgentClient;
use agent_proto::filesystem_client::FilesystemClient;
use agent_proto::network_client::NetworkClient;
use agent_proto::secure_shell_client::SecureShellClient;
use agent_proto::{
    CreateDirRequest, DownloadRequest, FileMD5Request, FileStatRequest, IPAddrRequest,
    InterfaceRequest, RouteInfo, RouteRequest, SetFileModeRequest, SetFileOwnerRequest, UploadChunk,
};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn agent_info(channel: Channel) -> Result<()> {
    let mut client = AgentClient::new(channel);
    let resp = client.get_agent_info(()).await?.into_inner();
    print_json(&resp)
}

pub async fn guest_info(channel: Channel) -> Result<()> {
    let mut client = AgentClient::new(channel);
    let resp = client.get_guest_info(()).await?.into_inner();
    print_json(&resp)
}

pub async fn agent_shutdown(channel: Channel) -> Result<()> {
    let mut client = AgentClient::new(channel);
    client.shutdown_agent(()).await?;
    Ok(())
}

pub async fn ip_addr_show(channel: Channel) -> Result<()> {
    let mut client = NetworkClient::new(channel);
    let resp = client.get_interfaces(()).await?.into_inner();
    print_json(&resp)
}

pub async fn ip_addr_add(channel: Channel, name: &str, cidr: &str) -> Result<()> {
    let mut client = NetworkClient::new(channel);
    client
        .add_ip_addr(IPAddrRequest {
            name: name.to_string(),
            cidr: cidr.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn ip_addr_del(channel: Channel, name: &str, cidr: &str) -> Result<()> {
    let mut client = NetworkClient::new(channel);
    client
        .del_ip_addr(IPAddrRequest {
            name: name.to_string(),
            cidr: cidr.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn ip_link_set(channel: Channel, name: &str, up: bool) -> Result<()> {
    let mut client = NetworkClient::new(channel);
    let req = InterfaceRequest { name: name.to_string() };
    if up {
        client.set_interface_link_up(req).await?;
    } else {
        client.set_interface_link_down(req).await?;
    }
    Ok(())
}

pub async fn ip_route_list(channel: Channel) -> Result<()> {
    let mut client = NetworkClient::new(channel);
    let resp = client.get_route_list(()).await?.into_inner();
    print_json(&resp)
}

pub async fn ip_route_add(channel: Channel, destination: &str, gateway: Option<&str>, name: &str) -> Result<()> {
    update_route(channel, destination, gateway, name, true).await
}

pub async fn ip_route_del(channel: Channel, destination: &str, gateway: Option<&str>, name: &str) -> Result<()> {
    update_route(channel, destination, gateway, name, false).await
}

async fn update_route(channel: Channel, destination: &str, gateway: Option<&str>, name: &str, add: bool) -> Result<()> {
    let mut client = NetworkClient::new(channel);

    let interfaces = client.get_interfaces(()).await?.into_inner().interfaces;
    let iface = interfaces
        .iter()
        .find(|i| i.name == name)
        .ok_or_else(|| anyhow!("no such interface: {name}"))?;

    let route = RouteInfo {
        family: 0,
        destination: destination.to_string(),
        gateway: gateway.unwrap_or_default().to_string(),
        out_if_index: iface.index,
        table: 0,
        scope: 0,
    };
    let req = RouteRequest { route: Some(route) };
    if add {
        client.add_route(req).await?;
    } else {
        client.del_route(req).await?;
    }
    Ok(())
}

pub async fn fs_ls(channel: Channel, path: &str, long: bool, dir_only: bool) -> Result<()> {
    let mut client = FilesystemClient::new(channel);
    let resp = client
        .get_file_stat(FileStatRequest {
            path: path.to_string(),
            with_dir_content: !dir_only,
        })
        .await?
        .into_inner();
    if long {
        print_json(&resp)
    } else if resp.is_dir && !dir_only {
        for entry in &resp.dir_entries {
            println!("{entry}");
        }
        Ok(())
    } else {
        println!("{}", resp.path);
        Ok(())
    }
}

pub async fn fs_cat(channel: Channel, path: &str) -> Result<()> {
    let mut client = FilesystemClient::new(channel);
    let mut stream = client
        .download_file(DownloadRequest { path: path.to_string() })
        .await?
        .into_inner();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    while let Some(chunk) = stream.message().await? {
        out.write_all(&chunk.data)?;
    }
    Ok(())
}

pub async fn fs_mkdir(channel: Channel, path: &str, mode: u32, parents: bool) -> Result<()> {
    let mut client = FilesystemClient::new(channel);
    client
        .create_dir(CreateDirRequest {
            path: path.to_string(),
            mode,
            parents,
        })
        .await?;
    Ok(())
}

pub async fn fs_chmod(channel: Channel, path: &str, mode: u32) -> Result<()> {
    let mut client = FilesystemClient::new(channel);
    client
        .set_file_mode(SetFileModeRequest {
            path: path.to_string(),
            mode,
        })
        .await?;
    Ok(())
}

pub async fn fs_chown(channel: Channel, path: &str, owner_group: &str) -> Result<()> {
    let (owner, group) = match owner_group.split_once(':') {
        Some((o, g)) if !g.is_empty() => (o, g),
        Some((o, _)) => (o, o),
        None => (owner_group, owner_group),
    };
    let mut client = FilesystemClient::new(channel);
    client
        .set_file_owner(SetFileOwnerRequest {
            path: path.to_string(),
            owner: owner.to_string(),
            group: group.to_string(),
        })
        .await?;
    Ok(())
}

pub async fn fs_md5sum(channel: Channel, path: &str) -> Result<()> {
    let mut client = FilesystemClient::new(channel);
    let resp = client
        .get_file_md5_hash(FileMD5Request { path: path.to_string() })
        .await?
        .into_inner();
    println!("{}  {}", resp.hex_digest, path);
    Ok(())
}

pub async fn fs_freeze(channel: Channel) -> Result<()> {
    FilesystemClient::new(channel).freeze(()).await?;
    Ok(())
}

pub async fn fs_unfreeze(channel: Channel) -> Result<()> {
    FilesystemClient::new(channel).unfreeze(()).await?;
    Ok(())
}

const GUEST_PREFIX: &str = "guest:";

/// `rcp guest:SRC DST` or `rcp SRC guest:DST`. Exactly one side must carry
/// the `guest:` prefix.
pub async fn rcp(channel: Channel, src: &str, dst: &str) -> Result<()> {
    match (src.strip_prefix(GUEST_PREFIX), dst.strip_prefix(GUEST_PREFIX)) {
        (Some(guest_src), None) => download(channel, guest_src, Path::new(dst)).await,
        (None, Some(guest_dst)) => upload(channel, Path::new(src), guest_dst).await,
        (Some(_), Some(_)) => bail!("only one side of rcp may carry a 'guest:' prefix"),
        (None, None) => bail!("rcp requires exactly one 'guest:' source or destination"),
    }
}

async fn upload(channel: Channel, src: &Path, dest_path: &str) -> Result<()> {
    let data = std::fs::read(src).with_context(|| format!("reading {}", src.display()))?;
    let mut client = FilesystemClient::new(channel);

    const CHUNK: usize = 2 * 1024 * 1024;
    let mut chunks = Vec::new();
    let mut first = true;
    for window in data.chunks(CHUNK) {
        chunks.push(UploadChunk {
            dest_path: if first { dest_path.to_string() } else { String::new() },
            data: window.to_vec(),
        });
        first = false;
    }
    if chunks.is_empty() {
        chunks.push(UploadChunk {
            dest_path: dest_path.to_string(),
            data: Vec::new(),
        });
    }

    client
        .upload_file(tokio_stream::iter(chunks))
        .await
        .with_context(|| format!("uploading to {dest_path}"))?;
    Ok(())
}

async fn download(channel: Channel, src_path: &str, dst: &Path) -> Result<()> {
    let final_dst = if dst.is_dir() {
        let base = Path::new(src_path)
            .file_name()
            .ok_or_else(|| anyhow!("invalid remote source path: {src_path}"))?;
        dst.join(base)
    } else {
        dst.to_path_buf()
    };

    let dir = final_dst.parent().unwrap_or_else(|| Path::new("."));
    let file_name = final_dst
        .file_name()
        .ok_or_else(|| anyhow!("invalid destination path: {}", final_dst.display()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name.to_string_lossy()))
        .tempfile_in(dir)?;

    let mut client = FilesystemClient::new(channel);
    let mut stream = client
        .download_file(DownloadRequest {
            path: src_path.to_string(),
        })
        .await?
        .into_inner();
    while let Some(chunk) = stream.message().await? {
        tmp.write_all(&chunk.data)?;
    }
    tmp.persist(&final_dst)?;
    Ok(())
}

pub async fn secure_shell(
    channel: Channel,
    cid: u32,
    user: &str,
    shell: Option<&str>,
    command: &[String],
) -> Result<()> {
    let mut client = SecureShellClient::new(channel);
    let resp = client.get_user_key(()).await?.into_inner();

    let mut key_file = tempfile::Builder::new().prefix("private.").suffix(".key").tempfile()?;
    key_file.write_all(resp.private_key_pem.as_bytes())?;
    let key_path: PathBuf = key_file.path().to_path_buf();
    std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o400))?;
    // Keep the tempfile handle alive through exec by leaking it: the ssh
    // child process needs the file to remain on disk after we exec into it.
    std::mem::forget(key_file);

    let proxy_command = format!("socat - VSOCK-CONNECT:{cid}:{}", resp.port);

    let mut args: Vec<String> = vec![
        "-i".to_string(),
        key_path.display().to_string(),
        "-o".to_string(),
        format!("ProxyCommand={proxy_command}"),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        format!("{user}@guest"),
        "-p".to_string(),
        resp.port.to_string(),
    ];
    if let Some(shell) = shell {
        args.push("-o".to_string());
        args.push("SendEnv=SHELL".to_string());
        std::env::set_var("SHELL", shell);
    }
    if !command.is_empty() {
        args.push("--".to_string());
        args.extend(command.iter().cloned());
    }

    let err = std::process::Command::new("ssh").args(&args).exec();
    Err(anyhow!("failed to exec ssh: {err}"))
}
