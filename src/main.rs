//! Hive - 命令行入口
//!
//! `hive "<input>"`：创建 Session，运行续跑 worker 直到该 Session 进入终态，然后打印最终回复。
//! `hive --worker`：只运行常驻 worker（Ctrl-C 退出），处理持久化队列中的续跑消息。

use anyhow::Context;
use hive::config::{load_config, AppConfig};
use hive::{Engine, SessionStatus};
use tokio_util::sync::CancellationToken;

const USAGE: &str = "usage: hive [--user <id>] [--provider <name>] [--thread <id>] \"<input>\"\n       hive --worker";

#[derive(Debug, Default)]
struct Args {
    user: Option<String>,
    provider: Option<String>,
    thread: Option<String>,
    worker: bool,
    input: Vec<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--user" => args.user = Some(it.next().context("--user needs a value")?),
            "--provider" => args.provider = Some(it.next().context("--provider needs a value")?),
            "--thread" => args.thread = Some(it.next().context("--thread needs a value")?),
            "--worker" => args.worker = true,
            "-h" | "--help" => anyhow::bail!(USAGE),
            _ => args.input.push(arg),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let cfg = load_config(None).unwrap_or_else(|e| {
        eprintln!("config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    hive::observability::init(cfg.observability.json);

    let engine = Engine::from_config(&cfg)
        .await
        .context("failed to build engine")?;

    if args.worker {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                on_signal.cancel();
            }
        });
        engine.run_worker(cancel).await;
        return Ok(());
    }

    let input = args.input.join(" ");
    if input.trim().is_empty() {
        anyhow::bail!(USAGE);
    }
    let user = args.user.as_deref().unwrap_or("local");
    let session = engine
        .submit(user, &input, args.thread.as_deref(), args.provider.as_deref())
        .await
        .context("failed to start session")?;
    let done = engine
        .run_until_finished(&session.id)
        .await
        .context("session did not finish")?;

    match done.status {
        SessionStatus::Completed => {
            let response = done
                .final_response
                .context("completed session has no final response")?;
            println!("{}", response.content);
            if response.verification_exhausted {
                eprintln!("warning: the answer did not pass verification");
            }
            Ok(())
        }
        status => anyhow::bail!(
            "session {} ended as {}: {}",
            done.id,
            status,
            done.error.unwrap_or_default()
        ),
    }
}
