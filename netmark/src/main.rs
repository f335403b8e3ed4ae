use std::process;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod admin_socket;
        mod cli;
        mod dns_socket;
        mod fwmark_socket;

        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use std::sync::Arc;

        use tokio::fs;
        use tokio::net::UnixListener;
        use tokio::signal::unix::{SignalKind, signal};
        use tokio::sync::{RwLock, broadcast, mpsc};

        use netmark_lib::admin::Dispatcher;
        use netmark_lib::dns::SystemResolver;
        use netmark_lib::firewall::FirewallController;
        use netmark_lib::link_monitor::{self, LinkEvent};
        use netmark_lib::logging;
        use netmark_lib::network::NetworkController;
        use netmark_lib::routing::{RealFilterOps, RealNetlinkOps, RouteController};

        use admin_socket::AdminRequest;

        // Avoid musl's default allocator due to degraded performance
        // https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
        #[global_allocator]
        static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

        pub type ProdNetworkController = NetworkController<RealNetlinkOps, RealFilterOps>;
        type ProdDispatcher = Dispatcher<RealNetlinkOps, RealFilterOps, SystemResolver>;

        enum SignalMessage {
            Shutdown,
            RotateLogs,
        }

        async fn signal_channel() -> Result<mpsc::Receiver<SignalMessage>, exitcode::ExitCode> {
            let (sender, receiver) = mpsc::channel(32);
            let mut sigint = signal(SignalKind::interrupt()).map_err(|error| {
                tracing::error!(?error, "error setting up SIGINT handler");
                exitcode::IOERR
            })?;
            let mut sigterm = signal(SignalKind::terminate()).map_err(|error| {
                tracing::error!(?error, "error setting up SIGTERM handler");
                exitcode::IOERR
            })?;
            let mut sighup = signal(SignalKind::hangup()).map_err(|error| {
                tracing::error!(?error, "error setting up SIGHUP handler");
                exitcode::IOERR
            })?;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(_) = sigint.recv() => {
                            if sender.send(SignalMessage::Shutdown).await.is_err() {
                                break;
                            }
                        }
                        Some(_) = sigterm.recv() => {
                            if sender.send(SignalMessage::Shutdown).await.is_err() {
                                break;
                            }
                        }
                        Some(_) = sighup.recv() => {
                            if sender.send(SignalMessage::RotateLogs).await.is_err() {
                                break;
                            }
                        }
                        else => break,
                    }
                }
            });

            Ok(receiver)
        }

        async fn socket_listener(socket_path: &Path, mode: u32) -> Result<UnixListener, exitcode::ExitCode> {
            match socket_path.try_exists() {
                Ok(true) => {
                    // The init system guarantees a single instance, so an
                    // existing file is a leftover from a dead one.
                    fs::remove_file(socket_path).await.map_err(|e| {
                        tracing::error!(error = ?e, "error removing stale socket file");
                        exitcode::IOERR
                    })?;
                }
                Ok(false) => (),
                Err(e) => {
                    tracing::error!(error = ?e, "error checking socket path");
                    return Err(exitcode::IOERR);
                }
            };

            let socket_dir = socket_path.parent().ok_or_else(|| {
                tracing::error!("socket path has no parent");
                exitcode::UNAVAILABLE
            })?;
            fs::create_dir_all(socket_dir).await.map_err(|e| {
                tracing::error!(error = %e, "error creating socket directory");
                exitcode::IOERR
            })?;

            let listener = UnixListener::bind(socket_path).map_err(|e| {
                tracing::error!(error = ?e, socket = %socket_path.display(), "error binding socket");
                exitcode::OSFILE
            })?;

            fs::set_permissions(socket_path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| {
                    tracing::error!(error = ?e, "error setting socket permissions");
                    exitcode::NOPERM
                })?;

            Ok(listener)
        }

        async fn daemon(args: cli::Cli) -> Result<(), exitcode::ExitCode> {
            let reload_handle = setup_logging(&args.log_file)?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                "starting {}",
                env!("CARGO_PKG_NAME")
            );

            let mut signal_receiver = signal_channel().await?;

            // One netlink connection serves every route and rule edit.
            let (conn, handle, _) = rtnetlink::new_connection().map_err(|e| {
                tracing::error!(error = ?e, "cannot open rtnetlink connection");
                exitcode::OSERR
            })?;
            tokio::spawn(conn);

            let netlink = RealNetlinkOps::new(handle);
            let filter = RealFilterOps;
            let resolver = Arc::new(SystemResolver);

            let network = Arc::new(RwLock::new(NetworkController::new(RouteController::new(
                netlink,
                filter.clone(),
            ))));
            let firewall = FirewallController::new(filter);

            // The ladder must exist before the first network is created.
            if !args.skip_rule_ladder {
                if let Err(e) = network.read().await.init_rule_ladder().await {
                    tracing::error!(error = %e, "cannot install policy rule ladder");
                    return Err(exitcode::OSERR);
                }
            }
            if let Err(e) = firewall.setup_hooks().await {
                tracing::warn!(error = %e, "cannot seed firewall child chains");
            }

            let mut dispatcher: ProdDispatcher = Dispatcher::new(network.clone(), firewall, resolver.clone());

            // Listening sockets: admin for the framework, fwmark and DNS
            // for unprivileged apps.
            let admin_listener = socket_listener(&args.admin_socket, 0o660).await?;
            let fwmark_listener = socket_listener(&args.fwmark_socket, 0o666).await?;
            let dnsproxy_listener = socket_listener(&args.dnsproxy_socket, 0o666).await?;

            let (broadcast_sender, _) = broadcast::channel(64);
            let (cmd_sender, mut cmd_receiver) = mpsc::channel::<AdminRequest>(32);
            let (link_sender, mut link_receiver) = mpsc::channel::<LinkEvent>(64);

            tokio::spawn(admin_socket::serve(
                admin_listener,
                cmd_sender,
                broadcast_sender.clone(),
            ));
            tokio::spawn(fwmark_socket::serve(fwmark_listener, network.clone()));
            tokio::spawn(dns_socket::serve(dnsproxy_listener, network.clone(), resolver));
            tokio::spawn(async move {
                if let Err(e) = link_monitor::run(link_sender).await {
                    tracing::error!(error = %e, "link monitor stopped");
                }
            });

            tracing::info!("entering main daemon loop");
            let exit = loop {
                tokio::select! {
                    Some(signal) = signal_receiver.recv() => match signal {
                        SignalMessage::Shutdown => {
                            tracing::info!("initiate shutdown");
                            break Ok(());
                        }
                        SignalMessage::RotateLogs => {
                            rotate_logs(&reload_handle, &args.log_file);
                        }
                    },
                    Some(request) = cmd_receiver.recv() => {
                        // One command at a time: the single-writer
                        // discipline every controller depends on.
                        let reply = dispatcher.dispatch_line(&request.line).await;
                        let _ = request.resp.send(reply);
                    }
                    Some(event) = link_receiver.recv() => {
                        let (code, message) = event.broadcast();
                        // No subscribers is fine; events are best-effort.
                        let _ = broadcast_sender.send(format!("{} {message}", code.as_u16()));
                    }
                    else => {
                        tracing::error!("unexpected channel closure");
                        break Err(exitcode::IOERR);
                    }
                }
            };

            for path in [&args.admin_socket, &args.fwmark_socket, &args.dnsproxy_socket] {
                if let Err(e) = fs::remove_file(path).await {
                    tracing::warn!(error = %e, socket = %path.display(), "failed removing socket");
                }
            }

            exit
        }

        fn setup_logging(log_file: &Option<PathBuf>) -> Result<Option<logging::LogReloadHandle>, exitcode::ExitCode> {
            match log_file {
                Some(log_path) => {
                    let layer = logging::make_file_fmt_layer(log_path).map_err(|e| {
                        eprintln!("failed to open log file {}: {e}", log_path.display());
                        exitcode::IOERR
                    })?;
                    Ok(Some(logging::setup_log_file(layer)))
                }
                None => {
                    logging::setup_stdout();
                    Ok(None)
                }
            }
        }

        fn rotate_logs(reload_handle: &Option<logging::LogReloadHandle>, log_file: &Option<PathBuf>) {
            // The rotation service has already renamed the old file before
            // signalling, so opening the path again creates the new one.
            if let (Some(handle), Some(path)) = (reload_handle, log_file) {
                match logging::make_file_fmt_layer(path).map(|layer| handle.reload(layer)) {
                    Ok(_) => tracing::info!("reloaded log file after rotation"),
                    Err(e) => eprintln!("failed to reopen log file {}: {e}", path.display()),
                }
            } else {
                tracing::debug!("no log file configured, nothing to rotate");
            }
        }

        #[tokio::main(flavor = "multi_thread")]
        async fn main() {
            let args = cli::parse();

            match daemon(args).await {
                Ok(()) => (),
                Err(code) => {
                    tracing::warn!("abnormal exit");
                    process::exit(code);
                }
            }
        }
    } else {
        fn main() {
            eprintln!("netmark manages Linux kernel networking state and only runs on Linux");
            process::exit(1);
        }
    }
}
