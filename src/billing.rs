use crate::ledger::{Account, Ledger};
use crate::model::{LedgerAction, UsageRecord};
use crate::openai::TokenUsage;
use crate::util::now_ms;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// Write-once sink for per-request usage rows.
pub trait UsageLog: Send + Sync {
    /// Persists `record`, assigning its id.
    fn record(&self, record: UsageRecord) -> anyhow::Result<UsageRecord>;
}

/// `ceil((pt*pp + ct*cp) / price_unit)`, never negative.
pub fn cost(usage: TokenUsage, prompt_price: i64, completion_price: i64, price_unit: i64) -> i64 {
    let raw = usage.prompt_tokens as i128 * prompt_price as i128
        + usage.completion_tokens as i128 * completion_price as i128;
    if raw <= 0 {
        return 0;
    }
    let unit = price_unit.max(1) as i128;
    let c = (raw + unit - 1) / unit;
    c.min(i64::MAX as i128) as i64
}

/// Everything needed to bill one finished upstream call.
#[derive(Debug, Clone, Serialize)]
pub struct Charge {
    pub client_id: u64,
    pub model_id: u64,
    pub model_name: String,
    pub user_id: u64,
    pub caller_ip: String,
    pub request_id: String,
    pub trace_id: String,
    pub prompt_price: i64,
    pub completion_price: i64,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub cost: i64,
    pub failed_writes: usize,
}

#[derive(Serialize)]
struct DeadLetter {
    ts_ms: u64,
    write: &'static str,
    error: String,
    cost: i64,
    charge: Charge,
}

/// Applies charges: one debit per pool plus one usage row.
pub struct MeterCore {
    ledger: Arc<dyn Ledger>,
    usage_log: Arc<dyn UsageLog>,
    price_unit: i64,
    dead_letter: Option<mpsc::Sender<DeadLetter>>,
}

impl MeterCore {
    pub fn new(ledger: Arc<dyn Ledger>, usage_log: Arc<dyn UsageLog>, price_unit: i64) -> Self {
        Self {
            ledger,
            usage_log,
            price_unit,
            dead_letter: None,
        }
    }

    /// Failed writes are appended as JSON lines to `path`.
    pub fn with_dead_letter(mut self, path: PathBuf) -> Self {
        self.dead_letter = Some(start_dead_letter_writer(path));
        self
    }

    /// Attempts all three writes regardless of individual failures. Never retries.
    pub fn settle(&self, charge: &Charge) -> Settlement {
        let cost = cost(
            charge.usage,
            charge.prompt_price,
            charge.completion_price,
            self.price_unit,
        );
        let reason = format!("{} request {}", charge.model_name, charge.request_id);
        let mut failed_writes = 0;

        if let Err(e) = self.ledger.append(
            Account::Client(charge.client_id),
            -cost,
            LedgerAction::Consumption,
            &reason,
        ) {
            failed_writes += 1;
            self.fail("client_ledger", e.to_string(), cost, charge);
        }
        if let Err(e) = self.ledger.append(
            Account::User(charge.user_id),
            -cost,
            LedgerAction::Consumption,
            &reason,
        ) {
            failed_writes += 1;
            self.fail("user_ledger", e.to_string(), cost, charge);
        }
        let record = UsageRecord {
            id: 0,
            client_id: charge.client_id,
            model_id: charge.model_id,
            user_id: charge.user_id,
            caller_ip: charge.caller_ip.clone(),
            request_id: charge.request_id.clone(),
            trace_id: charge.trace_id.clone(),
            prompt_tokens: charge.usage.prompt_tokens,
            completion_tokens: charge.usage.completion_tokens,
            cost,
            created_at_ms: now_ms(),
        };
        if let Err(e) = self.usage_log.record(record) {
            failed_writes += 1;
            self.fail("usage_record", e.to_string(), cost, charge);
        }

        if failed_writes == 0 {
            tracing::debug!(
                trace_id = %charge.trace_id,
                client_id = charge.client_id,
                user_id = charge.user_id,
                cost,
                "charge settled"
            );
        }
        Settlement { cost, failed_writes }
    }

    fn fail(&self, write: &'static str, error: String, cost: i64, charge: &Charge) {
        tracing::error!(
            trace_id = %charge.trace_id,
            client_id = charge.client_id,
            user_id = charge.user_id,
            cost,
            write,
            error = %error,
            "metering write failed"
        );
        let Some(tx) = &self.dead_letter else {
            return;
        };
        let letter = DeadLetter {
            ts_ms: now_ms(),
            write,
            error,
            cost,
            charge: charge.clone(),
        };
        if tx.try_send(letter).is_err() {
            tracing::warn!(trace_id = %charge.trace_id, "dead-letter queue full, entry dropped");
        }
    }
}

/// Bounded post-response settlement queue drained by a dedicated thread, so
/// sled writes never run on a runtime worker.
pub struct Meter {
    core: Arc<MeterCore>,
    tx: Mutex<Option<mpsc::Sender<Charge>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    inflight: TaskTracker,
}

impl Meter {
    pub fn start(core: MeterCore, capacity: usize) -> anyhow::Result<Self> {
        let core = Arc::new(core);
        let (tx, mut rx) = mpsc::channel::<Charge>(capacity.max(1));

        let worker_core = core.clone();
        let worker = thread::Builder::new()
            .name("tollgate-meter".into())
            .spawn(move || {
                while let Some(charge) = rx.blocking_recv() {
                    worker_core.settle(&charge);
                }
            })?;

        Ok(Self {
            core,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            inflight: TaskTracker::new(),
        })
    }

    /// Spawns a response task that will submit a charge; `shutdown` waits for it.
    pub fn track<F>(&self, task: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inflight.spawn(task)
    }

    /// Queues a charge, waiting for room when the queue is full. Once the
    /// queue is closed the charge is settled inline instead.
    pub async fn submit(&self, charge: Charge) {
        let tx = self.tx.lock().ok().and_then(|t| t.clone());
        let charge = match tx {
            Some(tx) => match tx.send(charge).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(charge)) => charge,
            },
            None => charge,
        };
        tracing::warn!(trace_id = %charge.trace_id, "metering queue closed, settling inline");
        let core = self.core.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || core.settle(&charge)).await {
            tracing::error!(error = %e, "inline settlement panicked");
        }
    }

    /// Waits for tracked response tasks, then settles everything queued.
    pub async fn shutdown(&self) {
        self.inflight.close();
        self.inflight.wait().await;

        // the worker exits once the last sender is gone and the queue is empty
        let tx = self.tx.lock().ok().and_then(|mut t| t.take());
        drop(tx);

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                _ => tracing::error!("metering worker panicked"),
            }
        }
    }
}

fn start_dead_letter_writer(path: PathBuf) -> mpsc::Sender<DeadLetter> {
    let (tx, mut rx) = mpsc::channel::<DeadLetter>(2048);

    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "dead-letter log open failed");
                return;
            }
        };

        let mut pending = 0usize;
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                letter = rx.recv() => {
                    let Some(letter) = letter else { break; };
                    match serde_json::to_vec(&letter) {
                        Ok(mut line) => {
                            line.push(b'\n');
                            if let Err(e) = file.write_all(&line).await {
                                tracing::warn!(error = %e, "dead-letter write failed");
                            } else {
                                pending += 1;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "dead-letter encode failed"),
                    }
                    if pending >= 256 {
                        let _ = file.flush().await;
                        pending = 0;
                    }
                }
                _ = tick.tick() => {
                    if pending > 0 {
                        let _ = file.flush().await;
                        pending = 0;
                    }
                }
            }
        }

        let _ = file.flush().await;
    });

    tx
}
