//! Supervisor: configuration loading, component lifecycle, signal handling,
//! the periodic statistics task and orderly shutdown.

use std::process::ExitCode;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use poly_pkt_fwd::beacon::{self, BeaconCtx};
use poly_pkt_fwd::concentrator::{Concentrator, SPURIOUS_RESET_TRIGCNT};
use poly_pkt_fwd::config::{self, Config, PULL_TIMEOUT_MS};
use poly_pkt_fwd::downstream::{self, DownstreamCtx};
use poly_pkt_fwd::endpoint::Endpoint;
use poly_pkt_fwd::error::Error;
use poly_pkt_fwd::ghost;
use poly_pkt_fwd::gps::{self, GpsCtx};
use poly_pkt_fwd::hal::VirtualConcentrator;
use poly_pkt_fwd::shutdown::ExitSignal;
use poly_pkt_fwd::stats::{self, DownstreamCounters, GpsMeas, StatusReport, UpstreamCounters};
use poly_pkt_fwd::timeref::GpsTimeRef;
use poly_pkt_fwd::upstream::{self, FwdFilter, UpstreamCtx};
use poly_pkt_fwd::xtal::{self, SharedXtal};

const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(()) => {
            info!("INFO: Exiting packet forwarder program");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("ERROR: [main] {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    info!("*** Poly Packet Forwarder for LoRa Gateway ***");
    info!("Version: {}", VERSION_STRING);

    /* load configuration files */
    let Config { gateway: conf, sx1301 } = config::load_from_dir(std::path::Path::new("."))?;

    /* start GPS a.s.a.p., to allow it to lock */
    let mut gps_port = None;
    let mut gps_active = false;
    if conf.gps && !conf.fake_gps {
        match &conf.gps_tty_path {
            Some(tty_path) => match serialport::new(tty_path.as_str(), 9600)
                .timeout(Duration::from_millis(1000))
                .open()
            {
                Ok(port) => {
                    info!("INFO: [main] TTY port {} open for GPS synchronization", tty_path);
                    gps_port = Some(port);
                    gps_active = true;
                }
                Err(e) => {
                    warn!(
                        "WARNING: [main] impossible to open {} for GPS sync (check permissions): {}",
                        tty_path, e
                    );
                }
            },
            None => warn!("WARNING: [main] GPS enabled but no gps_tty_path configured"),
        }
    }

    /* shared state */
    let exit = Arc::new(ExitSignal::new());
    let timeref = Arc::new(GpsTimeRef::new());
    let xtal_corr = Arc::new(SharedXtal::new());
    let meas_up = Arc::new(UpstreamCounters::default());
    let meas_dw = Arc::new(DownstreamCounters::default());
    let gps_meas = Arc::new(GpsMeas::new());
    let report = Arc::new(StatusReport::new());

    /* configure signal handling: SIGINT/SIGTERM request a graceful exit,
    SIGQUIT an abrupt one */
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, exit.exit_flag())
            .context("[main] failed to install signal handler")?;
    }
    signal_hook::flag::register(signal_hook::consts::SIGQUIT, exit.quit_flag())
        .context("[main] failed to install signal handler")?;

    /* open sockets towards every configured server; a dead endpoint is not
    fatal, the daemon continues with the remaining ones */
    let mut endpoints: Vec<Arc<Endpoint>> = Vec::new();
    for server in &conf.server_list {
        match Endpoint::connect(&server.address, server.port_up, server.port_down) {
            Ok(ep) => endpoints.push(Arc::new(ep)),
            Err(e) => error!("ERROR: {:#}", e),
        }
    }
    if endpoints.is_empty() {
        warn!("WARNING: [main] no server could be contacted, gateway will run blind");
    }

    /* set up and start the concentrator */
    let conc = Arc::new(Concentrator::new(Box::new(VirtualConcentrator::new())));
    if let Some(sx1301) = &sx1301 {
        conc.with_hal(|hal| sx1301.configure(hal));
    }
    if conf.radiostream {
        info!("INFO: [main] Starting the concentrator");
        conc.start().map_err(|e| {
            error!("ERROR: [main] failed to start the concentrator: {:#}", e);
            Error::LGW_START_ERROR
        })?;
        info!("INFO: [main] concentrator started, radio packets can now be received.");
    } else {
        warn!("WARNING: Radio is disabled, radio packets cannot be sent or received.");
    }

    /* start the ghost listener */
    let mut ghost_source = None;
    let mut ghost_handle = None;
    if conf.ghoststream {
        let (source, handle) = ghost::start(exit.clone(), &conf.ghost_address, conf.ghost_port)?;
        info!("INFO: [main] Ghost listener started, ghost packets can now be received.");
        ghost_source = Some(source);
        ghost_handle = Some(handle);
    }

    /* the monitor client is not linked into this build; its remote-shell
    features are deliberately not part of the forwarding core */
    if conf.monitor {
        warn!(
            "WARNING: [main] monitor is enabled in the configuration but no monitor client is available, ignoring"
        );
        for call in &conf.system_calls {
            info!("INFO: ignored system command: \"{}\"", call);
        }
    }

    if !conf.radiostream && !conf.ghoststream && !conf.statusstream {
        warn!("WARNING: [main] All streams have been disabled, gateway may be completely silent.");
    }

    let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    /* spawn a worker task; a task failing takes the whole daemon down */
    fn spawn_task(
        label: &'static str,
        thread_name: String,
        exit: Arc<ExitSignal>,
        body: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<(&'static str, JoinHandle<Result<()>>)> {
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let result = body();
                if result.is_err() {
                    exit.request_exit();
                }
                result
            })
            .with_context(|| format!("[main] impossible to create {} thread", label))?;
        Ok((label, handle))
    }

    /* beacon task, pre-armed by the GNSS task through a single-slot channel */
    let mut beacon_arm_tx = None;
    if conf.beacon && gps_active {
        let (arm_tx, arm_rx) = crossbeam_channel::bounded(1);
        beacon_arm_tx = Some(arm_tx);
        let ctx = BeaconCtx {
            exit: exit.clone(),
            conc: conc.clone(),
            timeref: timeref.clone(),
            xtal: xtal_corr.clone(),
            arm: arm_rx,
            reference_coord: conf.reference_coord(),
            beacon_freq_hz: conf.beacon_freq_hz,
        };
        tasks.push(spawn_task("beacon", "beacon".into(), exit.clone(), move || {
            beacon::thread_beacon(ctx)
        })?);
    } else if conf.beacon {
        warn!("WARNING: [main] beacon is enabled but requires a real GPS PPS, beacon disabled");
    }

    /* GNSS ingest and time-reference validation tasks */
    if let Some(port) = gps_port {
        let ctx = GpsCtx {
            exit: exit.clone(),
            conc: conc.clone(),
            timeref: timeref.clone(),
            gps_meas: gps_meas.clone(),
            beacon_arm: beacon_arm_tx,
            beacon_period: if conf.beacon { conf.beacon_period } else { 0 },
            beacon_offset: conf.beacon_offset,
        };
        tasks.push(spawn_task("gps", "gps".into(), exit.clone(), move || {
            gps::thread_gps(ctx, port)
        })?);

        let (exit_v, timeref_v, xtal_v) = (exit.clone(), timeref.clone(), xtal_corr.clone());
        tasks.push(spawn_task("valid", "valid".into(), exit.clone(), move || {
            xtal::thread_valid(exit_v, timeref_v, xtal_v)
        })?);
    }

    /* upstream fan-out task */
    if conf.upstream {
        let ctx = UpstreamCtx {
            exit: exit.clone(),
            conc: conc.clone(),
            radiostream: conf.radiostream,
            ghost: ghost_source.clone(),
            endpoints: endpoints.clone(),
            timeref: timeref.clone(),
            gps_active,
            meas_up: meas_up.clone(),
            report: report.clone(),
            gateway_eui: conf.gateway_id,
            filter: FwdFilter {
                fwd_valid_pkt: conf.forward_crc_valid,
                fwd_error_pkt: conf.forward_crc_error,
                fwd_nocrc_pkt: conf.forward_crc_disabled,
            },
            push_timeout_half: Duration::from_micros(500 * conf.push_timeout_ms),
        };
        tasks.push(spawn_task("up", "up".into(), exit.clone(), move || {
            upstream::thread_up(ctx)
        })?);
    }

    /* one downstream task per live endpoint */
    if conf.downstream {
        for endpoint in &endpoints {
            let ctx = DownstreamCtx {
                exit: exit.clone(),
                conc: conc.clone(),
                endpoint: endpoint.clone(),
                timeref: timeref.clone(),
                gps_active,
                meas_dw: meas_dw.clone(),
                gateway_eui: conf.gateway_id,
                keepalive_time: Duration::from_secs(conf.keepalive_interval),
                pull_timeout: Duration::from_millis(PULL_TIMEOUT_MS),
                autoquit_threshold: conf.autoquit_threshold,
            };
            tasks.push(spawn_task(
                "down",
                format!("down-{}", endpoint.addr),
                exit.clone(),
                move || downstream::thread_down(ctx),
            )?);
        }
    }

    /* main loop task: statistics collection and the concentrator health
    probe */
    let mut fatal: Option<anyhow::Error> = None;
    'main: while exit.should_run() {
        /* wait for the next reporting interval, staying responsive to the
        exit flags */
        for _ in 0..conf.stat_interval {
            if !exit.should_run() {
                break 'main;
            }
            std::thread::sleep(Duration::from_secs(1));
        }

        let (timeref_state, coord) = stats_inputs(&conf, gps_active, &timeref, &gps_meas);
        let stat = stats::build_report(
            meas_up.take(),
            meas_dw.take(),
            conf.gps,
            timeref_state,
            coord,
            &conf.platform,
            &conf.email,
            &conf.description,
        );
        if conf.statusstream {
            /* will be sent to the servers by the upstream task */
            report.publish(stat);
        }

        /* probe for the spurious-reset signature */
        if conf.radiostream {
            match conc.trigger_count() {
                Ok(SPURIOUS_RESET_TRIGCNT) => {
                    error!("ERROR: [main] unintended SX1301 reset detected, terminating packet forwarder.");
                    fatal = Some(Error::LGW_SPURIOUS_RESET.into());
                    exit.request_quit();
                    break;
                }
                _ => {}
            }
        }
    }

    /* wait for the worker tasks to observe the exit flags */
    for (name, handle) in tasks {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("ERROR: [main] {} thread failed: {:#}", name, e);
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
            Err(_) => error!("ERROR: [main] {} thread panicked", name),
        }
    }
    if let Some(handle) = ghost_handle {
        let _ = handle.join();
    }

    /* if an exit signal was received, try to quit properly */
    if exit.is_exit() && conf.radiostream {
        match conc.stop() {
            Ok(()) => info!("INFO: concentrator stopped successfully"),
            Err(_) => warn!("WARNING: failed to stop concentrator successfully"),
        }
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

type StatsInputs = (Option<(bool, Option<u64>)>, Option<(gps::Coord, bool)>);

/// Gather the GPS-related inputs of the periodic report: time-reference
/// state when GPS sync runs, and the position to publish (faked reference
/// coordinates override the measured ones).
fn stats_inputs(
    conf: &config::GatewayConf,
    gps_active: bool,
    timeref: &GpsTimeRef,
    gps_meas: &GpsMeas,
) -> StatsInputs {
    let timeref_state = if gps_active {
        let (tref, valid) = timeref.snapshot();
        Some((valid, tref.age()))
    } else {
        None
    };

    let coord = if conf.gps && conf.fake_gps {
        Some((conf.reference_coord(), true))
    } else if gps_active {
        let (coord_ok, coord) = gps_meas.get();
        coord_ok.then_some((coord, false))
    } else {
        None
    };

    (timeref_state, coord)
}
