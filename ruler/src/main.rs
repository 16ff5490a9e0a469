use std::{
    net::{Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ruler::*;

fn main() {
    use clap::{
        Arg, Command, ValueHint, crate_authors, crate_description, crate_name, crate_version,
        value_parser,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .args([
            Arg::new("port")
                .long("port")
                .help("port the webhook server listens on")
                .value_parser(value_parser!(u16))
                .default_value("8080"),
            Arg::new("tls")
                .long("tls")
                .help("serve HTTPS when the certificate pair is present")
                .value_parser(value_parser!(bool))
                .default_value("true"),
            Arg::new("cert_dir")
                .long("cert-dir")
                .help("directory containing TLS cert+key pair")
                .value_hint(ValueHint::DirPath)
                .default_value("/etc/telemetry-ruler"),
            Arg::new("cert_name")
                .long("cert-name")
                .help("file inside `cert-dir` containing the TLS certificate")
                .default_value("tls.crt"),
            Arg::new("key_name")
                .long("key-name")
                .help("file inside `cert-dir` containing the TLS certificate key")
                .default_value("tls.key"),
            Arg::new("max_in_flight")
                .long("max-in-flight")
                .help("maximum records matched concurrently")
                .value_parser(value_parser!(usize))
                .default_value("200"),
            Arg::new("rule_webhook_name")
                .long("rule-webhook-name")
                .help("name of the ConfigMap holding the receiver document")
                .default_value(RULER_NAME),
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
        ]);

    if let Err(e) = match Args::try_from(&cmd.get_matches()) {
        Ok(args) => startup(args),
        Err(e) => Err(Error::from(e)),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    port: u16,
    tls: bool,
    cert_dir: PathBuf,
    cert_name: String,
    key_name: String,
    max_in_flight: usize,
    rule_webhook_name: String,
    introspection_address: SocketAddr,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            port: *m.get_one::<u16>("port").unwrap(),
            tls: *m.get_one::<bool>("tls").unwrap(),
            cert_dir: m.get_one::<String>("cert_dir").unwrap().into(),
            cert_name: m.get_one::<String>("cert_name").unwrap().clone(),
            key_name: m.get_one::<String>("key_name").unwrap().clone(),
            max_in_flight: *m.get_one::<usize>("max_in_flight").unwrap(),
            rule_webhook_name: m.get_one::<String>("rule_webhook_name").unwrap().clone(),
            introspection_address: m
                .get_one::<String>("introspection_address")
                .unwrap()
                .parse()?,
        })
    }
}

fn startup(args: Args) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    let stop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, stop))
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    use tokio::task::JoinSet;

    // Failing to find a kubeconfig is the only fatal error.
    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config)?.build();

    let rules = rules::StoreHandle::default();
    let mut hub = exporter::Hub::new();
    hub.register(exporter::WEBHOOK_RECEIVER, exporter::webhook::factory);
    hub.register(
        exporter::ALERTMANAGER_RECEIVER,
        exporter::alertmanager::factory,
    );
    hub.register(
        exporter::NOTIFICATION_MANAGER_RECEIVER,
        exporter::notificationmanager::factory,
    );
    let hub = Arc::new(hub);

    let loader = loader::Loader::new(
        client,
        args.rule_webhook_name.clone(),
        namespace(),
        rules.clone(),
        hub.clone(),
    );
    let namespaces = loader.namespaces();

    let (pool, _dispatcher) = worker::Pool::spawn(
        worker::PoolConfig {
            max_in_flight: args.max_in_flight,
            ..Default::default()
        },
        rules,
        hub,
    );
    let state = Arc::new(webhook::AppState {
        pool,
        namespaces: Some(namespaces),
        drain: webhook::Drain::default(),
    });

    info!("setup done, starting loader and webhook server");
    let mut tasks = JoinSet::new();
    tasks.spawn(loader.run(token.clone()));
    tasks.spawn(serve(
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, args.port)),
        args.tls,
        args.cert_dir.join(&args.cert_name),
        args.cert_dir.join(&args.key_name),
        state,
        token.clone(),
    ));
    while let Some(res) = tasks.join_next().await {
        match res {
            Err(e) => error!("error starting task: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from task: {e}");
                    token.cancel();
                }
            }
        };
    }
    Ok(())
}

async fn serve<Pa, Pb>(
    addr: SocketAddr,
    tls: bool,
    certfile: Pa,
    keyfile: Pb,
    state: Arc<webhook::AppState>,
    cancel: CancellationToken,
) -> Result<()>
where
    Pa: AsRef<Path>,
    Pb: AsRef<Path>,
{
    let certfile = certfile.as_ref();
    let keyfile = keyfile.as_ref();
    let app = webhook::app(state);

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(30)));
        });
    }

    if tls && certfile.exists() && keyfile.exists() {
        use axum_server::tls_openssl::OpenSSLConfig;
        let config = OpenSSLConfig::from_pem_file(certfile, keyfile)
            .map_err(|err| anyhow::anyhow!("tls config: {err}"))?;
        info!(%addr, "started webhook server (https)");
        axum_server::bind_openssl(addr, config)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    } else {
        if tls {
            warn!(
                cert = %certfile.display(),
                key = %keyfile.display(),
                "TLS requested but certificate pair not found, serving plain HTTP"
            );
        }
        info!(%addr, "started webhook server");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await?;
    }
    Ok(())
}
