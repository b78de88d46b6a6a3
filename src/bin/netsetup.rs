use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use log::{debug, info};
use serde::de::DeserializeOwned;

use virt_netsetup::api::VirtualMachineInstance;
use virt_netsetup::config::Config;
use virt_netsetup::constants::FILE_CONFIG;
use virt_netsetup::domain::Domain;
use virt_netsetup::fs::write_document;
use virt_netsetup::logger::init_logger;
use virt_netsetup::network::istio::Istio;
use virt_netsetup::network::link::{LinkLookup, NetlinkLinks};
use virt_netsetup::network::netns::run_in_netns;
use virt_netsetup::network::setup::{Controller, VmNetworkConfigurator};

/// Render the network interfaces of a VM instance into its domain document.
#[derive(Debug, Parser)]
#[command(name = "netsetup")]
struct Args {
    /// VM instance document (JSON).
    #[arg(long)]
    vmi: PathBuf,
    /// Domain document to update (JSON).
    #[arg(long)]
    domain: PathBuf,
    /// Pid of the process owning the pod network namespace.
    #[arg(long)]
    pid: i32,
    /// Pod interface bound to a VM interface, as <iface>=<pod-iface>.
    #[arg(long = "bind", value_parser = parse_binding)]
    bindings: Vec<(String, String)>,
    #[arg(long, default_value = FILE_CONFIG)]
    config: PathBuf,
    /// Where to write the updated domain, defaults to --domain.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn parse_binding(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((iface, pod_iface)) if !iface.is_empty() && !pod_iface.is_empty() => {
            Ok((iface.into(), pod_iface.into()))
        }
        _ => Err(format!("invalid binding {}, expected <iface>=<pod-iface>", value)),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("unable to read {:?}", path))?;
    serde_json::from_str(&data).map_err(|e| anyhow!("unable to parse {:?}: {}", path, e))
}

fn netlink_links() -> Result<Box<dyn LinkLookup>> {
    Ok(Box::new(NetlinkLinks::new()?))
}

fn run() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    init_logger(config.debug).map_err(|e| anyhow!("unable to initialize logger: {}", e))?;
    debug!("Config: {:?}", config);

    let vmi: VirtualMachineInstance = read_json(&args.vmi)?;
    let domain: Domain = read_json(&args.domain)?;
    let domain = Arc::new(Mutex::new(domain));

    let pod_ifaces: HashMap<String, String> = args.bindings.into_iter().collect();
    let configurator = VmNetworkConfigurator::new(
        domain.clone(),
        pod_ifaces,
        Arc::new(Istio::with_reserved_ports(config.reserved_ports.clone())),
        config.passt_log_file.clone(),
        netlink_links,
    );
    let controller = Controller::new(configurator);

    let pid = args.pid;
    controller.setup(&vmi, pid, |f| run_in_netns(pid, || f()), || Ok(()))?;

    let domain = domain
        .lock()
        .map_err(|_| anyhow!("domain lock poisoned"))?;
    let output = args.output.unwrap_or(args.domain);
    write_document(&output, &*domain)?;
    info!("Wrote domain {} to {:?}", domain.name, output);

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        // Use eprintln! here in case logger does not initialize.
        eprintln!("netsetup failed: {:#}", e);
        std::process::exit(1);
    }
}
