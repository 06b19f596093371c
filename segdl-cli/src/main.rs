mod cli;
mod error;
mod input;

use std::process;
use std::time::Duration;

use clap::Parser;
use segdl_engine::{
    Downloader, DownloaderConfig, EngineConfig, LiveOptions, ProgressDisplay, ProxyConfig,
    SessionReport,
};
use tracing::{Level, error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::{
    cli::Args,
    error::{AppError, Result},
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match run(args).await {
        Ok(report) if report.interrupted => process::exit(130),
        Ok(report) if report.all_complete() => {}
        Ok(_) => process::exit(2),
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<SessionReport> {
    init_logging(args.verbose, args.quiet)?;

    let mut streams = input::load_streams(&args.input).await?;
    let compact = args.compact;
    let display = if args.progress && !args.quiet {
        ProgressDisplay::Terminal
    } else {
        ProgressDisplay::Hidden
    };

    let config = build_config(&args)?;
    let downloader = Downloader::new(config)?.with_progress(display);

    let token = downloader.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling downloads");
            token.cancel();
        }
    });

    let report = downloader.download_streams(&mut streams).await;

    if report.stop_recording {
        info!("Record limit reached");
    }
    if report.interrupted {
        warn!("Session interrupted");
    }

    let json = if compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };
    println!("{json}");

    Ok(report)
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut base = DownloaderConfig::default()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_max_connections_per_host(args.connections_per_host);
    base.use_system_proxy = !args.no_system_proxy;
    base.params = input::parse_params(&args.params)?;

    for (name, value) in input::parse_headers(&args.headers)? {
        if name.eq_ignore_ascii_case("user-agent") {
            base = base.with_user_agent(value);
        } else {
            base = base.with_header(&name, &value);
        }
    }

    if let Some(patch) = &args.url_patch {
        base = base.with_url_patch(patch.clone());
    }

    if let Some(url) = &args.proxy {
        let mut proxy = ProxyConfig::from_url(url.clone());
        if let Some(proxy_type) = args.proxy_type {
            proxy.proxy_type = proxy_type;
        }
        match (&args.proxy_username, &args.proxy_password) {
            (Some(user), Some(pass)) => proxy = proxy.with_auth(user.clone(), pass.clone()),
            (None, None) => {}
            _ => {
                return Err(AppError::InvalidInput(
                    "proxy username and password must be given together".into(),
                ));
            }
        }
        base = base.with_proxy(proxy);
    }

    Ok(EngineConfig::default()
        .with_base(base)
        .with_max_rounds(args.max_rounds)
        .with_re_download_statuses(args.re_download_statuses.iter().copied())
        .with_decrypt(!args.no_decrypt)
        .with_offload_decryption(args.offload_decryption)
        .with_disable_concat(args.disable_concat)
        .with_live(LiveOptions {
            enabled: args.live,
            record_limit: args.record_limit.map(Duration::from_secs),
        }))
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    // Log lines go through the indicatif writer so they print above the
    // progress bars instead of over them.
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_target(false)
                .with_level(verbose),
        )
        .with(indicatif_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
