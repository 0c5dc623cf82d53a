//! Guest telemetry poller: samples uptime, load, memory, swap, block
//! devices, and logged-in users every 30 seconds, publishing the result for
//! `GetGuestInfo`/`SubscribeTelemetry` to read. Produces and forwards a
//! snapshot verbatim; does not interpret it further.

use std::io::Read;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use agent_proto::{BlockDevice, LoadAverage, LoggedUser, MemStat, SwapStat, TelemetrySample, Utsname};

use crate::config::TELEMETRY_INTERVAL;
use crate::error::Result;

const UTMP_RECORD_SIZE: usize = 384;
const UTMP_USER_PROCESS: i16 = 7;
const UTMP_PATH: &str = "/var/run/utmp";

/// Read-only handle to the poller's latest sample, shared by every RPC
/// handler that needs it.
#[derive(Clone)]
pub struct TelemetryHandle {
    rx: watch::Receiver<Option<TelemetrySample>>,
}

impl TelemetryHandle {
    pub fn latest(&self) -> Option<TelemetrySample> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TelemetrySample>> {
        self.rx.clone()
    }
}

pub fn spawn_poller(shutdown: CancellationToken) -> TelemetryHandle {
    let (tx, rx) = watch::channel(None);
    tokio::spawn(poll_loop(tx, shutdown));
    TelemetryHandle { rx }
}

async fn poll_loop(tx: watch::Sender<Option<TelemetrySample>>, shutdown: CancellationToken) {
    loop {
        match tokio::task::spawn_blocking(collect_sample).await {
            Ok(Ok(sample)) => {
                let _ = tx.send(Some(sample));
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "telemetry poll failed"),
            Err(e) => tracing::warn!(error = %e, "telemetry poll task panicked"),
        }

        tokio::select! {
            _ = tokio::time::sleep(TELEMETRY_INTERVAL) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

fn collect_sample() -> Result<TelemetrySample> {
    Ok(TelemetrySample {
        uname: Some(read_uname()),
        uptime_secs: read_uptime()?,
        loadavg: Some(read_loadavg()?),
        memory: Some(read_meminfo()?),
        swap: Some(read_swap()?),
        users: read_utmp().unwrap_or_default(),
        block_devices: read_block_devices().unwrap_or_default(),
    })
}

fn read_uname() -> Utsname {
    let info = rustix::system::uname();
    let cstr_to_string = |s: &std::ffi::CStr| s.to_string_lossy().into_owned();
    Utsname {
        sysname: cstr_to_string(info.sysname()),
        nodename: cstr_to_string(info.nodename()),
        release: cstr_to_string(info.release()),
        version: cstr_to_string(info.version()),
        machine: cstr_to_string(info.machine()),
        domainname: cstr_to_string(info.domainname()),
    }
}

fn read_uptime() -> Result<i64> {
    let content = std::fs::read_to_string("/proc/uptime")?;
    let secs: f64 = content
        .split_whitespace()
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    Ok(secs as i64)
}

fn read_loadavg() -> Result<LoadAverage> {
    let content = std::fs::read_to_string("/proc/loadavg")?;
    let mut fields = content.split_whitespace();
    let one = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let five = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let fifteen = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    Ok(LoadAverage { one, five, fifteen })
}

fn read_meminfo() -> Result<MemStat> {
    let content = std::fs::read_to_string("/proc/meminfo")?;
    let mut values = std::collections::HashMap::new();
    for line in content.lines() {
        if let Some((key, rest)) = line.split_once(':') {
            let kb: u64 = rest
                .trim()
                .trim_end_matches(" kB")
                .parse()
                .unwrap_or(0);
            values.insert(key.to_string(), kb * 1024);
        }
    }
    let get = |k: &str| values.get(k).copied().unwrap_or(0);
    Ok(MemStat {
        total: get("MemTotal"),
        free: get("MemFree"),
        buffers: get("Buffers"),
        cached: get("Cached"),
        free_total: get("MemFree") + get("Cached") + get("Buffers"),
    })
}

fn read_swap() -> Result<SwapStat> {
    let content = std::fs::read_to_string("/proc/meminfo")?;
    let mut total = 0;
    let mut free = 0;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("SwapTotal:") {
            total = rest.trim().trim_end_matches(" kB").parse::<u64>().unwrap_or(0) * 1024;
        } else if let Some(rest) = line.strip_prefix("SwapFree:") {
            free = rest.trim().trim_end_matches(" kB").parse::<u64>().unwrap_or(0) * 1024;
        }
    }
    Ok(SwapStat { total, free })
}

/// Parses `/var/run/utmp`'s fixed-size binary records, keeping only
/// `USER_PROCESS` entries (interactive logins), matching the classic
/// Linux `struct utmp` layout.
fn read_utmp() -> Result<Vec<LoggedUser>> {
    let mut file = std::fs::File::open(UTMP_PATH)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut out = Vec::new();
    for chunk in buf.chunks_exact(UTMP_RECORD_SIZE) {
        let ut_type = i16::from_le_bytes([chunk[0], chunk[1]]);
        if ut_type != UTMP_USER_PROCESS {
            continue;
        }
        // offsets: type(2)+pad(2)+pid(4) = 8, then device[32], id[4], user[32], host[256]
        let device = cstr_field(&chunk[8..8 + 32]);
        let user = cstr_field(&chunk[8 + 32 + 4..8 + 32 + 4 + 32]);
        let host = cstr_field(&chunk[8 + 32 + 4 + 32..8 + 32 + 4 + 32 + 256]);
        let time_off = 8 + 32 + 4 + 32 + 256 + 4 + 4;
        let login_time =
            i32::from_le_bytes([chunk[time_off], chunk[time_off + 1], chunk[time_off + 2], chunk[time_off + 3]])
                as i64;

        if user.is_empty() {
            continue;
        }

        out.push(LoggedUser {
            name: user,
            device,
            host,
            login_time,
        });
    }
    Ok(out)
}

fn cstr_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn read_block_devices() -> Result<Vec<BlockDevice>> {
    let entries = crate::freeze::mount_points()?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let stat = match nix::sys::statvfs::statvfs(entry.mount_file.as_str()) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let block_size = stat.fragment_size().max(stat.block_size()) as u64;
        out.push(BlockDevice {
            path: entry.device_spec,
            is_mounted: true,
            mount_point: entry.mount_file,
            size_total: stat.blocks() * block_size,
            size_used: (stat.blocks() - stat.blocks_free()) * block_size,
            size_avail: stat.blocks_available() * block_size,
            inodes_total: stat.files(),
            inodes_used: stat.files() - stat.files_free(),
            inodes_avail: stat.files_available(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstr_field_stops_at_first_nul() {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(b"pts1");
        assert_eq!(cstr_field(&bytes), "pts1");
    }

    #[test]
    fn cstr_field_handles_no_nul() {
        let bytes = *b"tty0";
        assert_eq!(cstr_field(&bytes), "tty0");
    }

    #[test]
    fn utmp_skips_non_user_process_records() {
        let mut record = vec![0u8; UTMP_RECORD_SIZE];
        // ut_type = 2 (LOGIN_PROCESS), not USER_PROCESS
        record[0..2].copy_from_slice(&2i16.to_le_bytes());
        let buf = record;
        assert_eq!(buf.chunks_exact(UTMP_RECORD_SIZE).count(), 1);

        let ut_type = i16::from_le_bytes([buf[0], buf[1]]);
        assert_ne!(ut_type, UTMP_USER_PROCESS);
    }

    #[test]
    fn meminfo_line_parsing_strips_kb_suffix_and_converts_to_bytes() {
        let content = "MemTotal:       16384000 kB\nMemFree:         2048000 kB\n";
        let mut values = std::collections::HashMap::new();
        for line in content.lines() {
            if let Some((key, rest)) = line.split_once(':') {
                let kb: u64 = rest.trim().trim_end_matches(" kB").parse().unwrap_or(0);
                values.insert(key.to_string(), kb * 1024);
            }
        }
        assert_eq!(values.get("MemTotal"), Some(&(16_384_000u64 * 1024)));
        assert_eq!(values.get("MemFree"), Some(&(2_048_000u64 * 1024)));
    }

    #[test]
    fn loadavg_parsing_reads_first_three_fields() {
        let content = "0.52 0.48 0.33 2/812 12345\n";
        let mut fields = content.split_whitespace();
        let one: f64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let five: f64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let fifteen: f64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        assert_eq!((one, five, fifteen), (0.52, 0.48, 0.33));
    }
}
