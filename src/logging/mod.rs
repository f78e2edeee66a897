// Logging module - tracing setup and the per-exchange log block
//
// Everything goes through `tracing`. stderr gets the human-readable fmt layer;
// an optional rolling JSON file gets the same events for later parsing.

use std::fmt::Write;

use axum::http::StatusCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogRotation, LoggingConfig};
use crate::proxy::record::{Exchange, Failure};

/// Install the global subscriber
///
/// Precedence: RUST_LOG env var > config file > default "info". The returned
/// guard flushes the file writer on drop and must live as long as the process.
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let default_filter = format!("moonpalace={},tower_http=info,axum=info", config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if !config.file_enabled {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.file_dir) {
        eprintln!(
            "Warning: Could not create log directory {:?}: {}",
            config.file_dir, e
        );
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return None;
    }

    let file_appender = match config.file_rotation {
        LogRotation::Hourly => {
            tracing_appender::rolling::hourly(&config.file_dir, &config.file_prefix)
        }
        LogRotation::Daily => tracing_appender::rolling::daily(&config.file_dir, &config.file_prefix),
        LogRotation::Never => tracing_appender::rolling::never(&config.file_dir, &config.file_prefix),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    Some(guard)
}

/// `200 OK`, or `---` when no response arrived
fn status_line(status: Option<u16>) -> String {
    match status.map(|code| (code, StatusCode::from_u16(code))) {
        Some((_, Ok(status))) => match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        },
        Some((code, Err(_))) => code.to_string(),
        None => "---".to_string(),
    }
}

/// Render one exchange as a multi-line block
///
/// Layout: request line with latency, request headers, response headers and
/// upstream metadata, completion stats, error, warnings.
pub(crate) fn exchange_block(exchange: &Exchange) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail
    let _ = write_block(&mut out, exchange);
    out
}

fn write_block(out: &mut String, ex: &Exchange) -> std::fmt::Result {
    let mut target = ex.path.clone();
    if !ex.query.is_empty() {
        target.push('?');
        target.push_str(&ex.query);
    }
    write!(
        out,
        "{:<6} {} {} {:.2}s",
        ex.method,
        target,
        status_line(ex.status),
        ex.latency.as_secs_f64()
    )?;

    if !ex.request_content_type.is_empty() {
        write!(out, "\n  - Request Headers: ")?;
        write!(out, "\n    - Content-Type:    {}", ex.request_content_type)?;
        if !ex.accept_encoding.is_empty() {
            write!(out, "\n    - Accept-Encoding: {}", ex.accept_encoding)?;
        }
        if !ex.request_id.is_empty() {
            write!(out, "\n    - X-Request-Id:    {}", ex.request_id)?;
        }
    }

    if !ex.response_content_type.is_empty() {
        write!(out, "\n  - Response Headers: ")?;
        write!(out, "\n    - Content-Type:         {}", ex.response_content_type)?;
        if !ex.content_encoding.is_empty() {
            write!(out, "\n    - Content-Encoding:     {}", ex.content_encoding)?;
        }
    }

    let msh = &ex.msh;
    if !msh.request_id.is_empty() {
        write!(out, "\n    - Msh-Request-Id:       {}", msh.request_id)?;
        write!(
            out,
            "\n    - Server-Timing:        {:.4} s",
            msh.server_timing as f64 / 1000.0
        )?;
        let cache_id = if msh.context_cache_id.is_empty() {
            "<no-cache>"
        } else {
            msh.context_cache_id.as_str()
        };
        write!(out, "\n    - Msh-Context-Cache-Id: {}", cache_id)?;
        if !msh.uid.is_empty() {
            write!(out, "\n    - Msh-Uid:              {}", msh.uid)?;
            write!(out, "\n    - Msh-Gid:              {}", msh.gid)?;
        }
    }

    if !ex.moonshot_id.is_empty() {
        write!(out, "\n  - Response: ")?;
        write!(out, "\n    - id:                {}", ex.moonshot_id)?;
        if ex.ttft_ms > 0 {
            write!(out, "\n    - ttft:              {:.4} s", ex.ttft_ms as f64 / 1000.0)?;
        }
        match ex.usage {
            Some(usage) => {
                if let Some(tpot) = ex.time_per_output_token() {
                    write!(out, "\n    - tpot:              {:.4} s/token", tpot)?;
                    write!(out, "\n    - otps:              {:.4} tokens/s", 1.0 / tpot)?;
                }
                write!(out, "\n    - prompt_tokens:     {}", usage.prompt_tokens)?;
                write!(out, "\n    - completion_tokens: {}", usage.completion_tokens)?;
                write!(out, "\n    - total_tokens:      {}", usage.total_tokens)?;
                if usage.cached_tokens > 0 {
                    write!(out, "\n    - cached_tokens:     {}", usage.cached_tokens)?;
                }
            }
            None => {
                write!(out, "\n    - prompt_tokens:     unknown")?;
                write!(out, "\n    - completion_tokens: unknown")?;
                write!(out, "\n    - total_tokens:      unknown")?;
            }
        }
    }

    match &ex.failure {
        Some(Failure::Upstream { message }) if !message.is_empty() => {
            write!(out, "\n  - Moonshot Error: ")?;
            for line in message.lines() {
                write!(out, "\n    {}", line)?;
            }
        }
        Some(Failure::Proxy { message, .. }) if !message.is_empty() => {
            for line in message.lines() {
                write!(out, "\n  {}", line)?;
            }
        }
        _ => {}
    }

    for warning in &ex.warnings {
        write!(out, "\n  [WARNING] {}", warning)?;
    }
    Ok(())
}
