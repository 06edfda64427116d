use async_trait::async_trait;
use std::io::{BufRead, BufReader, Read, Write};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Asks whether an interrupted run should really stop
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self) -> bool;
}

/// Interactive "Terminate [y/n]? " prompt.
///
/// Input is read line by line on a dedicated OS thread that lives as long as
/// the process, so an abandoned prompt never leaves a blocking read behind on
/// the runtime. Lines typed while no prompt is showing are discarded.
pub struct PromptConfirmer {
    lines: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl PromptConfirmer {
    pub fn stdin() -> Self {
        Self::from_reader(std::io::stdin())
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawned = std::thread::Builder::new()
            .name("confirm-input".to_string())
            .spawn(move || {
                for line in BufReader::new(reader).lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Could not read confirmation input: {}", e);
                            break;
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            // Sender already dropped with the closure: behaves like EOF
            warn!("Could not start input reader: {}", e);
        }

        Self {
            lines: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Confirmer for PromptConfirmer {
    async fn confirm(&self) -> bool {
        let mut lines = self.lines.lock().await;
        while let Ok(stale) = lines.try_recv() {
            debug!("Discarding unprompted input {:?}", stale);
        }

        print!("Terminate [y/n]? ");
        let _ = std::io::stdout().flush();

        match lines.recv().await {
            Some(line) => line.trim().eq_ignore_ascii_case("y"),
            // EOF: nobody is there to answer
            None => true,
        }
    }
}

/// Fixed answer, for unattended runs
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::time::{sleep, timeout, Duration};

    /// Terminal stand-in: blocks until a line is typed, EOF once dropped
    struct Terminal(std_mpsc::Receiver<Vec<u8>>);

    impl Read for Terminal {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(bytes) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    fn terminal() -> (std_mpsc::Sender<Vec<u8>>, Arc<PromptConfirmer>) {
        let (keys, rx) = std_mpsc::channel();
        (keys, Arc::new(PromptConfirmer::from_reader(Terminal(rx))))
    }

    async fn answer(
        confirmer: &Arc<PromptConfirmer>,
        keys: &std_mpsc::Sender<Vec<u8>>,
        line: &str,
    ) -> bool {
        let pending = tokio::spawn({
            let confirmer = confirmer.clone();
            async move { confirmer.confirm().await }
        });
        sleep(Duration::from_millis(50)).await;
        keys.send(line.as_bytes().to_vec()).unwrap();
        timeout(Duration::from_secs(2), pending).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_answers_follow_each_prompt() {
        let (keys, confirmer) = terminal();
        assert!(!answer(&confirmer, &keys, "n\n").await);
        assert!(answer(&confirmer, &keys, "Y\n").await);
        assert!(!answer(&confirmer, &keys, "maybe\n").await);
    }

    #[tokio::test]
    async fn test_eof_confirms() {
        let confirmer = PromptConfirmer::from_reader(io::empty());
        assert!(timeout(Duration::from_secs(2), confirmer.confirm()).await.unwrap());
    }

    #[test]
    fn test_abandoned_prompt_does_not_block_runtime_shutdown() {
        let (keys, confirmer) = terminal();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            tokio::select! {
                _ = confirmer.confirm() => panic!("nobody answered"),
                _ = sleep(Duration::from_millis(100)) => {}
            }
        });
        let started = Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));

        // The next prompt still works, and input typed in between is not its answer
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            keys.send(b"y\n".to_vec()).unwrap();
            sleep(Duration::from_millis(50)).await;
            assert!(!answer(&confirmer, &keys, "n\n").await);
        });
    }
}
