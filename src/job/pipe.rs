//! Non-blocking worker output pipe.
//!
//! On unix both stdout and stderr of the worker are connected to the write
//! end of a single pipe, so the trace preserves the order in which the two
//! streams were written. The read end is registered with the tokio reactor
//! once and then read with non-blocking calls only. A cloneable
//! [`PipeReadiness`] handle lets the I/O task wait on many pipes without
//! holding the job lock.
//!
//! Other platforms fall back to reading stdout alone and polling.

use std::io;

use tokio::process::{Child, Command};

/// Result of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::fd::OwnedFd;
    use std::sync::Arc;

    use tokio::net::unix::pipe::Receiver;
    use tokio::process::{Child, Command};

    use super::ReadOutcome;

    pub struct OutputPipe {
        rx: Arc<Receiver>,
    }

    #[derive(Clone)]
    pub struct PipeReadiness {
        rx: Arc<Receiver>,
    }

    pub fn spawn_merged(mut cmd: Command) -> io::Result<(Child, OutputPipe)> {
        let (reader, writer) = std::io::pipe()?;
        cmd.stdout(writer.try_clone()?);
        cmd.stderr(writer);
        let mut child = cmd.spawn()?;
        // The command still owns the parent's copies of the write end.
        drop(cmd);

        match Receiver::from_file(File::from(OwnedFd::from(reader))) {
            Ok(rx) => Ok((child, OutputPipe { rx: Arc::new(rx) })),
            Err(e) => {
                let _ = child.start_kill();
                Err(e)
            }
        }
    }

    impl OutputPipe {
        pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            match self.rx.try_read(buf) {
                Ok(0) => Ok(ReadOutcome::Eof),
                Ok(n) => Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
                Err(e) => Err(e),
            }
        }

        pub fn readiness(&self) -> Option<PipeReadiness> {
            Some(PipeReadiness {
                rx: Arc::clone(&self.rx),
            })
        }
    }

    impl PipeReadiness {
        pub async fn ready(&self) -> io::Result<()> {
            self.rx.readable().await
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;
    use std::process::Stdio;

    use futures::FutureExt;
    use tokio::io::AsyncReadExt;
    use tokio::process::{Child, ChildStdout, Command};

    use super::ReadOutcome;

    pub struct OutputPipe {
        stdout: ChildStdout,
    }

    #[derive(Clone)]
    pub struct PipeReadiness;

    pub fn spawn_merged(mut cmd: Command) -> io::Result<(Child, OutputPipe)> {
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout was not captured"))?;
        Ok((child, OutputPipe { stdout }))
    }

    impl OutputPipe {
        pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
            match self.stdout.read(buf).now_or_never() {
                None => Ok(ReadOutcome::WouldBlock),
                Some(Ok(0)) => Ok(ReadOutcome::Eof),
                Some(Ok(n)) => Ok(ReadOutcome::Data(n)),
                Some(Err(e)) => Err(e),
            }
        }

        pub fn readiness(&self) -> Option<PipeReadiness> {
            None
        }
    }

    impl PipeReadiness {
        pub async fn ready(&self) -> io::Result<()> {
            std::future::pending().await
        }
    }
}

pub use imp::{OutputPipe, PipeReadiness};

/// Spawns `cmd` with its output connected to a new [`OutputPipe`].
///
/// The command is consumed so that no copy of the write end stays open in
/// this process; end of file is reported once the worker and all its
/// children have exited.
pub fn spawn_merged(cmd: Command) -> io::Result<(Child, OutputPipe)> {
    imp::spawn_merged(cmd)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn read_all(pipe: &mut OutputPipe) -> Vec<u8> {
        let readiness = pipe.readiness().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match pipe.read(&mut buf).unwrap() {
                ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::WouldBlock => {
                    tokio::time::timeout(Duration::from_secs(5), readiness.ready())
                        .await
                        .expect("pipe became readable")
                        .unwrap();
                }
                ReadOutcome::Eof => return out,
            }
        }
    }

    #[tokio::test]
    async fn test_merges_stdout_and_stderr() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo out; echo err 1>&2; echo done");

        let (mut child, mut pipe) = spawn_merged(cmd).unwrap();
        let output = read_all(&mut pipe).await;
        let status = child.wait().await.unwrap();

        assert!(status.success());
        assert_eq!(output, b"out\nerr\ndone\n");
    }

    #[tokio::test]
    async fn test_read_does_not_block_on_silent_worker() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("sleep 5");

        let (mut child, mut pipe) = spawn_merged(cmd).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf).unwrap(), ReadOutcome::WouldBlock);

        child.start_kill().unwrap();
        child.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cmd = Command::new("/nonexistent/worker/binary");
        assert!(spawn_merged(cmd).is_err());
    }
}
