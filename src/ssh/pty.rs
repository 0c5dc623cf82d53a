//! `/etc/passwd` user resolution and privilege-dropped PTY/exec spawning.

use std::io::{BufRead, BufReader};
use std::os::unix::process::CommandExt;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/// Scans `/etc/passwd` for `name`'s line (fields: name:passwd:uid:gid:gecos:home:shell).
pub fn lookup_user(name: &str) -> Result<UserRecord> {
    let file = std::fs::File::open("/etc/passwd")?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || fields[0] != name {
            continue;
        }
        return Ok(UserRecord {
            name: fields[0].to_string(),
            uid: fields[2]
                .parse()
                .map_err(|_| Error::Ssh(format!("malformed uid for user {name}")))?,
            gid: fields[3]
                .parse()
                .map_err(|_| Error::Ssh(format!("malformed gid for user {name}")))?,
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        });
    }
    Err(Error::NotFound(format!("no such user: {name}")))
}

fn drop_privileges(uid: u32, gid: u32) -> std::io::Result<()> {
    // SAFETY: runs after fork(), before exec(), in the child only; limited to
    // async-signal-safe libc calls.
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn shell_command(user: &UserRecord, shell_override: Option<&str>, env: &[(String, String)]) -> CommandBuilder {
    let shell = shell_override.unwrap_or(&user.shell);
    let mut cmd = CommandBuilder::new(shell);
    cmd.cwd(&user.home);
    cmd.env("HOME", &user.home);
    cmd.env("USER", &user.name);
    cmd.env("LOGNAME", &user.name);
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.uid(user.uid);
    cmd.gid(user.gid);
    cmd
}

fn exec_command(user: &UserRecord, shell_override: Option<&str>, command: &str) -> CommandBuilder {
    let shell = shell_override.unwrap_or(&user.shell);
    let mut cmd = CommandBuilder::new(shell);
    cmd.arg("-c");
    cmd.arg(command);
    cmd.cwd(&user.home);
    cmd.env("HOME", &user.home);
    cmd.env("USER", &user.name);
    cmd.env("LOGNAME", &user.name);
    cmd.uid(user.uid);
    cmd.gid(user.gid);
    cmd
}

pub struct Pty {
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
}

pub fn spawn_shell(
    user: &UserRecord,
    shell_override: Option<&str>,
    env: &[(String, String)],
    cols: u16,
    rows: u16,
) -> Result<Pty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::Ssh(format!("openpty: {e}")))?;

    let cmd = shell_command(user, shell_override, env);
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| Error::Ssh(format!("spawn shell: {e}")))?;
    drop(pair.slave);

    Ok(Pty {
        master: pair.master,
        child,
    })
}

pub fn spawn_exec(
    user: &UserRecord,
    shell_override: Option<&str>,
    command: &str,
    env: &[(String, String)],
    with_pty: bool,
) -> Result<SpawnedExec> {
    if with_pty {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| Error::Ssh(format!("openpty: {e}")))?;
        let mut cmd = exec_command(user, shell_override, command);
        for (k, v) in env {
            cmd.env(k, v);
        }
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| Error::Ssh(format!("spawn exec: {e}")))?;
        drop(pair.slave);
        Ok(SpawnedExec::Pty(Pty {
            master: pair.master,
            child,
        }))
    } else {
        let shell = shell_override.unwrap_or(&user.shell);
        let mut cmd = tokio::process::Command::new(shell);
        cmd.arg("-c").arg(command);
        cmd.current_dir(&user.home);
        cmd.env("HOME", &user.home);
        cmd.env("USER", &user.name);
        cmd.env("LOGNAME", &user.name);
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        let uid = user.uid;
        let gid = user.gid;
        unsafe {
            cmd.pre_exec(move || drop_privileges(uid, gid));
        }
        let child = cmd.spawn()?;
        Ok(SpawnedExec::Piped(Box::new(child)))
    }
}

pub enum SpawnedExec {
    Pty(Pty),
    Piped(Box<tokio::process::Child>),
}

/// Maps a wait status to the SSH exit-status convention: 128 + signal when
/// the child was killed by a signal, the raw exit code otherwise.
pub fn exit_code_for(code: u32, signalled: bool) -> u32 {
    if signalled {
        128 + code
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_passes_through_plain_exit() {
        assert_eq!(exit_code_for(0, false), 0);
        assert_eq!(exit_code_for(17, false), 17);
    }

    #[test]
    fn exit_code_offsets_signals_by_128() {
        assert_eq!(exit_code_for(9, true), 137);
        assert_eq!(exit_code_for(15, true), 143);
    }

    #[test]
    fn lookup_user_finds_root() {
        let root = lookup_user("root").expect("root must exist in /etc/passwd");
        assert_eq!(root.name, "root");
        assert_eq!(root.uid, 0);
    }

    #[test]
    fn lookup_user_rejects_unknown_name() {
        let err = lookup_user("no-such-user-abcxyz").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
