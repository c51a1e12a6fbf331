//! 外部子进程管理 (ffmpeg / ffprobe)
//!
//! 所有关闭路径统一为: 优雅信号 → 限时等待 → 强制kill → 回收

use std::fmt;
use std::io::{self, BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const DROP_GRACE: Duration = Duration::from_millis(500);

/// 强制中止句柄, 供控制线程在泵线程卡住时使用
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn abort(&self) {
        (self.0)()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AbortHandle")
    }
}

/// stderr排空线程
///
/// 子进程退出(stderr EOF)时线程结束
struct StderrDrain {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

impl StderrDrain {
    fn spawn(name: &str, stderr: ChildStderr) -> io::Result<Self> {
        let (done_tx, done) = crossbeam_channel::bounded::<()>(1);
        let process = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("{}-stderr", name))
            .spawn(move || {
                let _done = done_tx;
                let reader = BufReader::new(stderr);
                for line in reader.lines() {
                    match line {
                        Ok(line) if line.trim().is_empty() => {}
                        Ok(line) => {
                            if line.to_ascii_lowercase().contains("error") {
                                warn!(target: "ffmpeg", process = %process, "{}", line);
                            } else {
                                debug!(target: "ffmpeg", process = %process, "{}", line);
                            }
                        }
                        Err(_) => break,
                    }
                }
            })?;
        Ok(Self { handle, done })
    }

    /// 限时join; 子孙进程仍占用stderr时放弃等待
    fn join(self, name: &str) {
        match self.done.recv_timeout(DRAIN_JOIN_TIMEOUT) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                let _ = self.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("⚠️ {} stderr排空线程未退出, 放弃join", name);
            }
        }
    }
}

/// 受管子进程
pub struct ManagedChild {
    name: String,
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    drain: Option<StderrDrain>,
    exit: Option<ExitStatus>,
}

impl ManagedChild {
    /// 启动子进程; stderr总是被接管并转发到日志
    pub fn spawn(name: &str, command: &mut Command) -> io::Result<Self> {
        command.stderr(Stdio::piped());
        let mut child = command.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let drain = match child.stderr.take() {
            Some(stderr) => match StderrDrain::spawn(name, stderr) {
                Ok(d) => Some(d),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e);
                }
            },
            None => None,
        };

        debug!("{} 已启动 (pid {})", name, pid);
        Ok(Self {
            name: name.to_string(),
            pid,
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout,
            drain,
            exit: None,
        })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let status = lock(&self.child).try_wait()?;
        self.exit = status;
        Ok(status)
    }

    /// 等待退出, 超时返回 None
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// 持锁检查并发送SIGTERM, 避免与中止句柄并发回收后误发信号
    fn signal_if_running(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        let mut child = lock(&self.child);
        let status = child.try_wait()?;
        if status.is_none() {
            request_shutdown(child.id());
        }
        drop(child);
        self.exit = status;
        Ok(status)
    }

    /// 关闭stdin → SIGTERM → 限时等待 → kill → 回收 → join stderr线程
    pub fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        drop(self.stdin.take());

        let status = match self.signal_if_running()? {
            Some(status) => status,
            None => match self.wait_timeout(grace)? {
                Some(status) => status,
                None => {
                    warn!(
                        "⚠️ {} (pid {}) 在{:?}内未退出, 强制kill",
                        self.name, self.pid, grace
                    );
                    let mut child = lock(&self.child);
                    // 已退出时kill返回InvalidInput, 忽略
                    let _ = child.kill();
                    let status = child.wait()?;
                    drop(child);
                    self.exit = Some(status);
                    status
                }
            },
        };

        drop(self.stdout.take());
        if let Some(drain) = self.drain.take() {
            drain.join(&self.name);
        }
        info!("{} (pid {}) 已退出: {}", self.name, self.pid, status);
        Ok(status)
    }

    /// 可跨线程使用的强制kill句柄
    pub fn abort_handle(&self) -> AbortHandle {
        let weak: Weak<Mutex<Child>> = Arc::downgrade(&self.child);
        let name = self.name.clone();
        AbortHandle::new(move || {
            if let Some(child) = weak.upgrade() {
                let mut child = lock(&child);
                if let Ok(None) = child.try_wait() {
                    warn!("🛑 强制中止 {} (pid {})", name, child.id());
                    let _ = child.kill();
                }
            }
        })
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if self.exit.is_none() || self.drain.is_some() {
            if let Err(e) = self.terminate(DROP_GRACE) {
                warn!("❌ 回收 {} 失败: {}", self.name, e);
            }
        }
    }
}

fn lock(child: &Mutex<Child>) -> std::sync::MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(unix)]
fn request_shutdown(pid: u32) {
    // SAFETY: 仅向自己启动且尚未回收的子进程发送信号
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_shutdown(_pid: u32) {}

/// 运行短命令并收集stdout, 超时则kill
pub fn run_with_timeout(name: &str, command: &mut Command, timeout: Duration) -> io::Result<(ExitStatus, Vec<u8>)> {
    use std::io::Read;

    command.stdin(Stdio::null()).stdout(Stdio::piped());
    let mut child = ManagedChild::spawn(name, command)?;
    let mut stdout = child
        .take_stdout()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout not captured"))?;

    // stdout在独立线程读取, 避免管道写满导致子进程阻塞
    let (tx, rx) = crossbeam_channel::bounded::<io::Result<Vec<u8>>>(1);
    thread::Builder::new()
        .name(format!("{}-stdout", name))
        .spawn(move || {
            let mut buf = Vec::new();
            let res = stdout.read_to_end(&mut buf).map(|_| buf);
            let _ = tx.send(res);
        })?;

    match child.wait_timeout(timeout)? {
        Some(status) => {
            let output = rx
                .recv_timeout(DRAIN_JOIN_TIMEOUT)
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stdout reader stalled"))??;
            child.terminate(Duration::ZERO)?;
            Ok((status, output))
        }
        None => {
            child.terminate(Duration::ZERO)?;
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", name, timeout),
            ))
        }
    }
}
