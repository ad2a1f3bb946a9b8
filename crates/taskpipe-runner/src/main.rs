//! Demo driver for the taskpipe primitives.
//!
//! Topology: a producer feeds ASCII digits
//! into a named queue; a handler task drains the queue into a shared-memory
//! bounded stack; a consumer task pops and reports. `produce` runs the
//! producer side standalone (typically in a second process); `pipeline`
//! runs the handler and consumer tasks, optionally with a local producer
//! thread so a single invocation demonstrates the whole flow.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskpipe_ipc::{
    Alarm, BoundedStack, BufferSync, CancelToken, IpcError, ManagedTask, MsgQueue, TaskBody,
    TaskConfig,
};

mod config;

use config::PipelineConfig;

/// How often blocked pipeline loops re-check their cancel token.
const RECV_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "taskpipe-runner")]
#[command(about = "Producer/handler/consumer demo over named queues and shared memory.", long_about = None)]
struct Cli {
    /// JSON pipeline config; missing fields take the stock demo defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send paced digit messages into the named queue.
    Produce,
    /// Run the handler and consumer tasks over the shared buffer.
    Pipeline {
        /// Also run a producer thread in this process.
        #[arg(long)]
        local_producer: bool,
    },
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let cfg = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Produce => produce(&cfg),
        Command::Pipeline { local_producer } => pipeline(&cfg, local_producer),
    }
}

fn produce(cfg: &PipelineConfig) -> Result<ExitCode> {
    let mut queue = MsgQueue::open_or_create(&cfg.queue_name, cfg.queue_capacity, cfg.max_msg_len)
        .context("open queue")?;
    eprintln!(
        "producer: queue {} ({:?})",
        queue.name(),
        queue.ownership()
    );

    let alarm = Alarm::new().context("create alarm")?;
    let period = Duration::from_millis(cfg.period_ms);
    alarm.start(period, period).context("arm alarm")?;

    let seed = digit_seed();
    for i in 0..cfg.message_count {
        alarm.wait().context("alarm wait")?;
        let digit = b'0' + ((seed + i) % 10) as u8;
        queue
            .send_timeout(&[digit], Duration::from_secs(5))
            .context("send digit")?;
        eprintln!("producer: sent {}", digit as char);
    }
    alarm.stop().context("stop alarm")?;
    Ok(ExitCode::SUCCESS)
}

fn pipeline(cfg: &PipelineConfig, local_producer: bool) -> Result<ExitCode> {
    let handler_queue =
        MsgQueue::open_or_create(&cfg.queue_name, cfg.queue_capacity, cfg.max_msg_len)
            .context("open queue")?;

    let sync = BufferSync::new();
    let stack: Arc<BoundedStack<i32>> = Arc::new(
        BoundedStack::open_or_create(&cfg.region_name, cfg.buffer_capacity, sync)
            .context("open shared buffer")?,
    );

    let consumed = Arc::new(Mutex::new(Vec::new()));

    let handler = ManagedTask::new(
        TaskConfig::named("taskpipe-handler"),
        Handler {
            queue: handler_queue,
            stack: Arc::clone(&stack),
            expected: cfg.message_count,
        },
    )
    .context("handler task")?;

    let consumer = ManagedTask::new(
        TaskConfig::named("taskpipe-consumer"),
        Consumer {
            stack: Arc::clone(&stack),
            out: Arc::clone(&consumed),
            expected: cfg.message_count,
        },
    )
    .context("consumer task")?;

    handler.run().context("start handler")?;
    consumer.run().context("start consumer")?;

    let producer = if local_producer {
        let cfg = cfg.clone();
        Some(std::thread::spawn(move || produce(&cfg)))
    } else {
        None
    };

    let handler_code = handler.join().context("join handler")?;
    let consumer_code = consumer.join().context("join consumer")?;
    if let Some(producer) = producer {
        match producer.join() {
            Ok(res) => {
                res.context("local producer")?;
            }
            Err(_) => anyhow::bail!("local producer thread panicked"),
        }
    }

    let consumed = consumed.lock().unwrap_or_else(PoisonError::into_inner);
    eprintln!(
        "pipeline: handler={handler_code} consumer={consumer_code} consumed {} items",
        consumed.len()
    );
    for value in consumed.iter() {
        println!("{value}");
    }

    if handler_code == 0 && consumer_code == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Handler side of the pipeline: decode one digit per message and push it
/// into the shared buffer, blocking when the buffer is full.
struct Handler {
    queue: MsgQueue,
    stack: Arc<BoundedStack<i32>>,
    expected: usize,
}

impl TaskBody for Handler {
    fn run(&mut self, cancel: &CancelToken) -> i32 {
        let mut buf = vec![0u8; self.queue.max_msg_size()];
        let mut handled = 0;
        while handled < self.expected {
            if cancel.is_cancelled() {
                return 2;
            }
            let n = match self.queue.recv_timeout(&mut buf, RECV_TICK) {
                Ok(n) => n,
                Err(IpcError::Timeout { .. }) => continue,
                Err(err) => {
                    eprintln!("handler: receive failed: {err}");
                    return 1;
                }
            };
            if n == 0 || !buf[0].is_ascii_digit() {
                eprintln!("handler: skipping malformed message");
                continue;
            }
            let value = (buf[0] - b'0') as i32;
            if let Err(err) = self.stack.push(value, cancel) {
                eprintln!("handler: push failed: {err}");
                return 2;
            }
            handled += 1;
        }
        0
    }

    fn on_exit(&mut self) {
        eprintln!("handler: exiting");
    }
}

/// Consumer side: pop `expected` items from the shared buffer.
struct Consumer {
    stack: Arc<BoundedStack<i32>>,
    out: Arc<Mutex<Vec<i32>>>,
    expected: usize,
}

impl TaskBody for Consumer {
    fn run(&mut self, cancel: &CancelToken) -> i32 {
        for _ in 0..self.expected {
            match self.stack.pop(cancel) {
                Ok(value) => {
                    eprintln!("consumer: got {value}");
                    self.out.lock().unwrap_or_else(PoisonError::into_inner).push(value);
                }
                Err(IpcError::Cancelled { .. }) => return 2,
                Err(err) => {
                    eprintln!("consumer: pop failed: {err}");
                    return 1;
                }
            }
        }
        0
    }

    fn on_exit(&mut self) {
        eprintln!("consumer: exiting");
    }
}

/// Pseudo-random starting digit so repeated demo runs vary.
fn digit_seed() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as usize)
        .unwrap_or(0)
}
