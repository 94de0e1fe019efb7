//! Dubbo echo demo.
//!
//! Exports the services under `[provider]` with an echo implementation and
//! calls every `[references.*]` entry through its cluster once a second
//! until Ctrl+C or SIGTERM. Shutdown stops new calls on both sides and waits
//! for in-flight ones to drain.
//!
//! Usage: `dubbo-echo [config.toml]` (defaults to `echo.toml`).

use std::sync::Arc;
use std::time::Duration;

use dubbo_cluster::{
    default_routers, ClusterRegistry, InvokerFactory, LoadBalanceRegistry, RegistryDirectory,
    ServiceEvent,
};
use dubbo_proto::{RemoteException, Value};
use dubbo_rpc::filter::Builtins;
use dubbo_rpc::protocol::MethodHandler;
use dubbo_rpc::{
    handler_fn, ApplicationConfig, DubboProtocol, Exporter, FilterRegistry, Invocation, Invoker,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CALL_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dubbo_echo=info".parse()?))
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "echo.toml".to_owned());
    let config = ApplicationConfig::load_from(&path)?;
    let app = config.application.name.clone();
    info!(
        config = %path,
        application = %app,
        references = config.references.len(),
        "configuration loaded"
    );

    let builtins = Builtins::default();
    let protocol = Arc::new(DubboProtocol::new(Arc::new(FilterRegistry::with_builtins(
        &builtins,
    ))));

    let mut exporters: Vec<Exporter> = Vec::new();
    if let Some(provider) = &config.provider {
        for (name, service) in &provider.services {
            let url = service.to_url(&app, provider)?;
            let exporter = protocol.export(url, echo_methods()).await?;
            info!(service = %name, url = %exporter.url(), "echo service exported");
            exporters.push(exporter);
        }
    }

    let clusters = ClusterRegistry::with_defaults(Arc::new(LoadBalanceRegistry::with_defaults(
        Arc::clone(&builtins.status),
    )));
    let mut references: Vec<(String, Arc<dyn Invoker>)> = Vec::new();
    for (name, reference) in &config.references {
        let consumer_url = reference.consumer_url(&app);
        let routers = default_routers(&consumer_url, &builtins.status);
        let factory: Arc<dyn InvokerFactory> = protocol.clone();
        let directory =
            Arc::new(RegistryDirectory::new(consumer_url, factory).with_routers(routers));
        for url in reference.provider_urls(&app)? {
            if let Err(e) = directory.notify(ServiceEvent::add(url.clone())).await {
                warn!(
                    reference = %name,
                    provider = %url.address(),
                    error = %e,
                    "provider unreachable"
                );
            }
        }
        let invoker = clusters.join(directory)?;
        info!(reference = %name, cluster = %reference.cluster, "reference ready");
        references.push((name.clone(), invoker));
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining");
        on_signal.cancel();
    });

    call_until_cancelled(&references, &shutdown).await;

    builtins.consumer_shutdown.reject();
    builtins.provider_shutdown.reject();
    let drained = builtins
        .consumer_shutdown
        .wait_for_drain(config.shutdown.timeout)
        .await
        && builtins
            .provider_shutdown
            .wait_for_drain(config.shutdown.timeout)
            .await;
    if !drained {
        warn!(timeout = ?config.shutdown.timeout, "shutting down with requests in flight");
    }

    for exporter in &exporters {
        exporter.unexport();
    }
    for (_, invoker) in &references {
        invoker.destroy();
    }
    protocol.destroy().await;

    info!("echo demo stopped");
    Ok(())
}

fn echo_methods() -> Vec<(String, Arc<dyn MethodHandler>)> {
    let echo = handler_fn(|args: Vec<Value>, _| async move {
        Ok::<_, RemoteException>(args.into_iter().next().unwrap_or(Value::Null))
    });
    vec![
        ("echo".to_owned(), Arc::clone(&echo)),
        ("$echo".to_owned(), echo),
    ]
}

async fn call_until_cancelled(
    references: &[(String, Arc<dyn Invoker>)],
    shutdown: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(CALL_INTERVAL);
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        sequence += 1;
        for (name, invoker) in references {
            let message = format!("hello #{sequence}");
            let mut invocation = Invocation::new("echo", vec![Value::from(message.as_str())]);
            match invoker.invoke(&mut invocation).await.into_result() {
                Ok(reply) => info!(reference = %name, sent = %message, reply = ?reply, "echo"),
                Err(e) => error!(
                    reference = %name,
                    error = %e,
                    error_type = e.error_type(),
                    "echo failed"
                ),
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
