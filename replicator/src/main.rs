use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use is_terminal::IsTerminal;
use k8s_openapi::api::{core, rbac};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use replicator::adapters::Replicate;
use replicator::engine::Replicator;
use replicator::liveness::{self, AppState, Liveness};
use replicator::namespaces::NamespaceWatcher;
use replicator::{Context, Error, Result};

fn main() {
    use clap::{Arg, ArgAction, Command, crate_description, crate_name, crate_version};
    use std::process;

    let kind_flag = |name: &'static str, default: &'static str, help: &'static str| {
        Arg::new(name)
            .long(name)
            .help(help)
            .value_parser(clap::value_parser!(bool))
            .num_args(0..=1)
            .require_equals(true)
            .default_value(default)
            .default_missing_value("true")
    };
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .args([
            Arg::new("kubeconfig")
                .long("kubeconfig")
                .env("KUBECONFIG")
                .help("path to a kubeconfig; empty means in-cluster"),
            Arg::new("resync-period")
                .long("resync-period")
                .help("full relist cadence and sync-probe timeout")
                .default_value("30m"),
            Arg::new("status-addr")
                .long("status-addr")
                .help("listen address for the HTTP status endpoint")
                .default_value(":9102"),
            Arg::new("allow-all")
                .long("allow-all")
                .help("disable the replication-allowed gate for pulls (dangerous)")
                .action(ArgAction::SetTrue),
            Arg::new("cluster-domain")
                .long("cluster-domain")
                .help("cluster DNS suffix used for Service replicas")
                .default_value("cluster.local"),
            kind_flag("replicate-secrets", "true", "replicate Secrets"),
            kind_flag("replicate-config-maps", "true", "replicate ConfigMaps"),
            kind_flag("replicate-roles", "false", "replicate Roles"),
            kind_flag("replicate-role-bindings", "false", "replicate RoleBindings"),
            kind_flag("replicate-services", "false", "replicate Services"),
            kind_flag("replicate-service-accounts", "false", "replicate ServiceAccounts"),
            Arg::new("log-level")
                .long("log-level")
                .help("log filter when RUST_LOG is unset")
                .default_value("info"),
            Arg::new("log-format")
                .long("log-format")
                .value_parser(["auto", "text", "json"])
                .default_value("auto"),
        ]);

    if let Err(e) = match Args::try_from(&cmd.get_matches()) {
        Ok(args) => startup(args),
        Err(e) => Err(e),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

enum LogFormat {
    Auto,
    Text,
    Json,
}

struct Args {
    kubeconfig: Option<PathBuf>,
    resync: Duration,
    status_addr: SocketAddr,
    allow_all: bool,
    cluster_domain: String,
    secrets: bool,
    config_maps: bool,
    roles: bool,
    role_bindings: bool,
    services: bool,
    service_accounts: bool,
    log_level: String,
    log_format: LogFormat,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = Error;

    fn try_from(m: &clap::ArgMatches) -> Result<Self> {
        let flag = |name: &str| *m.get_one::<bool>(name).expect("defaulted");
        Ok(Self {
            kubeconfig: m
                .get_one::<String>("kubeconfig")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            resync: parse_duration(m.get_one::<String>("resync-period").expect("defaulted"))
                .map_err(Error::Parse)?,
            status_addr: parse_listen_addr(m.get_one::<String>("status-addr").expect("defaulted"))?,
            allow_all: m.get_flag("allow-all"),
            cluster_domain: m
                .get_one::<String>("cluster-domain")
                .expect("defaulted")
                .clone(),
            secrets: flag("replicate-secrets"),
            config_maps: flag("replicate-config-maps"),
            roles: flag("replicate-roles"),
            role_bindings: flag("replicate-role-bindings"),
            services: flag("replicate-services"),
            service_accounts: flag("replicate-service-accounts"),
            log_level: m.get_one::<String>("log-level").expect("defaulted").clone(),
            log_format: match m.get_one::<String>("log-format").expect("defaulted").as_str() {
                "text" => LogFormat::Text,
                "json" => LogFormat::Json,
                _ => LogFormat::Auto,
            },
        })
    }
}

/// Parse_duration understands `90s`, `30m`, `2h` and bare seconds.
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => s.split_at(at),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    let secs = match unit.trim() {
        "s" => Some(n),
        "m" => n.checked_mul(60),
        "h" => n.checked_mul(3600),
        _ => return Err(format!("invalid duration unit in {s:?}, want s, m or h")),
    };
    secs.map(Duration::from_secs)
        .ok_or_else(|| format!("duration {s:?} overflows"))
}

/// Parse_listen_addr accepts `host:port` or the bare-port `:port` form.
fn parse_listen_addr(s: &str) -> Result<SocketAddr> {
    let addr = if s.starts_with(':') {
        format!("0.0.0.0{s}").parse()?
    } else {
        s.parse()?
    };
    Ok(addr)
}

fn startup(args: Args) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    let json = match args.log_format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !std::io::stdout().is_terminal(),
    };
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if json {
            None
        } else {
            Some(tracing_subscriber::fmt::layer())
        })
        .with(if json {
            Some(tracing_subscriber::fmt::layer().json())
        } else {
            None
        });
    tracing::subscriber::set_global_default(collector)?;

    let recorder = PrometheusBuilder::new().install_recorder()?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    let sigtoken = token.clone();
    rt.handle().spawn(async move {
        use futures::StreamExt;
        use tokio_stream::wrappers::SignalStream;

        let term = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map(SignalStream::new);
        match term {
            Ok(mut term) => {
                tokio::select! {
                    res = signal::ctrl_c() => {
                        if let Err(err) = res {
                            error!("error reading interrupt: {err}");
                        }
                    }
                    _ = term.next() => {}
                }
            }
            Err(err) => {
                error!("cannot listen for SIGTERM: {err}");
                if let Err(err) = signal::ctrl_c().await {
                    error!("error reading interrupt: {err}");
                }
            }
        }
        info!("shutting down");
        sigtoken.cancel();
    });
    rt.block_on(run(args, recorder, token))
}

async fn run(args: Args, recorder: PrometheusHandle, token: CancellationToken) -> Result<()> {
    let config = match &args.kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kc, &Default::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    let client = kube::client::ClientBuilder::try_from(config)?.build();

    let ctx = Arc::new(Context {
        client: client.clone(),
        allow_all: args.allow_all,
        resync: args.resync,
        cluster_domain: args.cluster_domain.clone(),
    });
    if ctx.allow_all {
        warn!("running with --allow-all: every source is pullable from every namespace");
    }
    let namespaces = NamespaceWatcher::new(client, token.clone());
    let liveness = Liveness::new();

    let mut ctrls: JoinSet<Result<()>> = JoinSet::new();
    if args.secrets {
        spawn_kind::<core::v1::Secret>(&mut ctrls, &ctx, &namespaces, &liveness, &token);
    }
    if args.config_maps {
        spawn_kind::<core::v1::ConfigMap>(&mut ctrls, &ctx, &namespaces, &liveness, &token);
    }
    if args.roles {
        spawn_kind::<rbac::v1::Role>(&mut ctrls, &ctx, &namespaces, &liveness, &token);
    }
    if args.role_bindings {
        spawn_kind::<rbac::v1::RoleBinding>(&mut ctrls, &ctx, &namespaces, &liveness, &token);
    }
    if args.service_accounts {
        spawn_kind::<core::v1::ServiceAccount>(&mut ctrls, &ctx, &namespaces, &liveness, &token);
    }
    if args.services {
        spawn_kind::<core::v1::Service>(&mut ctrls, &ctx, &namespaces, &liveness, &token);
    }
    if ctrls.is_empty() {
        warn!("no kinds activated, only the status endpoint will run");
    }

    {
        let liveness = liveness.clone();
        let period = args.resync;
        let token = token.clone();
        ctrls.spawn(async move {
            liveness.probe_loop(period, token).await;
            Ok(())
        });
    }
    ctrls.spawn(liveness::serve(
        args.status_addr,
        AppState::new(liveness.clone(), recorder),
        token.clone(),
    ));

    info!("setup done, starting replicators");
    let mut first_err = None;
    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error joining task: {e}"),
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("fatal error: {e}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
                token.cancel();
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn spawn_kind<K: Replicate>(
    set: &mut JoinSet<Result<()>>,
    ctx: &Arc<Context>,
    namespaces: &NamespaceWatcher,
    liveness: &Liveness,
    token: &CancellationToken,
) {
    info!(kind = %K::kind(&()), "activating replicator");
    let probe = liveness.register(&K::kind(&()));
    let (ns_store, ns_events) = namespaces.subscribe();
    let r = Replicator::<K>::new(ctx.clone(), ns_store, ns_events, probe, token.clone());
    set.spawn(r.run());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn listen_addrs() {
        assert_eq!(
            parse_listen_addr(":9102").unwrap(),
            "0.0.0.0:9102".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("nonsense").is_err());
    }
}
