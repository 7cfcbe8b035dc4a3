//! Signal handling for cooperative shutdown.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the returned token; the engine
//! notices it at the next item boundary, after the current item's state is
//! saved. A second signal exits immediately with status 130.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let (mut sigterm, mut sighup) = {
            use tokio::signal::unix::{signal, SignalKind};
            match (
                signal(SignalKind::terminate()),
                signal(SignalKind::hangup()),
            ) {
                (Ok(term), Ok(hup)) => (term, hup),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Cannot listen for termination signals: {}", e);
                    return;
                }
            }
        };

        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("Cannot listen for Ctrl+C: {}", e);
                    return;
                }
            }

            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                tracing::info!("Shutdown requested, stopping after the current message");
                tracing::info!("Press Ctrl+C again to exit immediately");
                handler_token.cancel();
            } else {
                tracing::warn!("Forced exit, the current message will be retried next run");
                std::process::exit(130);
            }
        }
    });

    token
}
