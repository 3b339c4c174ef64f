//! Child-process plumbing for launches the daemon initiates: remote-display
//! services tied to virtual outputs, and application launches made on behalf
//! of layout restore (carrying the correlation token in the environment).

use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Spawn a shell command in its own process group with extra environment.
pub fn spawn_shell(
    command: &str,
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> Result<Child> {
    use std::os::unix::process::CommandExt;
    let mut builder = Command::new("sh");
    builder
        .arg("-lc")
        .arg(command)
        .envs(env.iter().map(|(key, value)| (key, value)))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    if let Some(cwd) = cwd {
        builder.current_dir(cwd);
    }
    builder
        .spawn()
        .with_context(|| format!("failed to spawn command: {command}"))
}

/// SIGTERM the child's process group, wait out the grace period, then SIGKILL.
pub fn terminate_child(child: &mut Child, grace_period: Duration) -> Result<()> {
    if child
        .try_wait()
        .context("failed to check process status")?
        .is_some()
    {
        return Ok(());
    }

    let pid = child.id() as i32;
    // Signal the process group so child trees also receive it.
    let signal_status = unsafe { libc::kill(-pid, libc::SIGTERM) };
    if signal_status != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            let direct = unsafe { libc::kill(pid, libc::SIGTERM) };
            if direct != 0 {
                let direct_err = std::io::Error::last_os_error();
                if direct_err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(direct_err).context("failed to send SIGTERM");
                }
            }
        }
    }

    let deadline = Instant::now() + grace_period;
    while Instant::now() < deadline {
        if child
            .try_wait()
            .context("failed waiting for process exit")?
            .is_some()
        {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }

    child.kill().context("failed to send SIGKILL")?;
    let _ = child.wait();
    Ok(())
}

/// Best-effort desktop notification, sent on the disruptive failure paths.
pub fn notify_user(title: &str, body: &str) {
    let binary = std::env::var("SWAYPROJD_NOTIFY_BIN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "notify-send".to_string());
    let _ = Command::new(binary)
        .arg(title)
        .arg(body)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_and_terminate_round_trip() {
        let mut child = spawn_shell("sleep 30", None, &[]).unwrap();
        terminate_child(&mut child, Duration::from_secs(2)).unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn spawned_process_sees_extra_environment() {
        let dir = std::env::temp_dir().join(format!(
            "swayprojd-launch-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("token.txt");
        let mut child = spawn_shell(
            &format!("printf '%s' \"$SWAYPROJ_LAUNCH_TOKEN\" > {}", marker.display()),
            Some(&dir),
            &[("SWAYPROJ_LAUNCH_TOKEN".to_string(), "tok-1".to_string())],
        )
        .unwrap();
        let _ = child.wait();
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "tok-1");
        let _ = std::fs::remove_dir_all(dir);
    }
}
