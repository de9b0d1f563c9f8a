use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use hive::config::Config;
use hive::orchestration::SubmitRequest;
use hive::vcpu::{assemble, disassemble, ExecClass, Program, VcpuLayout};
use hive::{hlog, Coordinator, NodeAgent, NodeAgentConfig, Result};

/// Hive - distributed virtual CPU cluster
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1     Enable debug logging (alternative to --debug)\n    HIVE_LOG=<level> Log level: error, warn, info, debug or trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Mirror log lines to stderr
    #[arg(long)]
    pub log_stderr: bool,

    /// Config file (defaults to ~/.hive/hive.toml)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a coordinator until interrupted
    Coordinator {
        /// Listen address (overrides config)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run a node agent until interrupted
    Node {
        /// Node identity (defaults to a random id)
        #[arg(long)]
        id: Option<String>,

        /// Coordinator address (overrides config)
        #[arg(long)]
        coordinator: Option<String>,

        /// Concurrent vCPU slots (overrides config)
        #[arg(long)]
        capacity: Option<u32>,
    },

    /// Run a program on an embedded cluster and print the JSON report
    Run {
        /// Program source (.hasm) or encoded words (.hbin)
        file: PathBuf,

        /// vCPUs to run the program on
        #[arg(long, default_value_t = 1)]
        vcpus: usize,

        /// Local node agents to start
        #[arg(long, default_value_t = 2)]
        nodes: usize,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },

    /// Assemble and validate a program without running it
    Check {
        /// Program source (.hasm) or encoded words (.hbin)
        file: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    hive::log::init_with_debug(cli.debug);
    hive::log::mirror_stderr(cli.log_stderr);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Coordinator { listen } => run_coordinator(config, listen),
        Command::Node {
            id,
            coordinator,
            capacity,
        } => run_node(config, id, coordinator, capacity),
        Command::Run {
            file,
            vcpus,
            nodes,
            timeout_secs,
        } => run_program(config, &file, vcpus, nodes, Duration::from_secs(timeout_secs)),
        Command::Check { file } => run_check(&config, &file),
        Command::Config => {
            println!("# {}", Config::config_path()?.display());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Load a program from text source or from raw encoded words.
fn load_program(path: &Path) -> Result<Program> {
    if path.extension().is_some_and(|ext| ext == "hbin") {
        return Ok(Program::from_bytes(&std::fs::read(path)?)?);
    }
    assemble(&std::fs::read_to_string(path)?)
}

fn run_coordinator(mut config: Config, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.coordinator.listen = listen;
    }
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let handle = Coordinator::new(config).start().await?;
        println!("Coordinator listening on {}", handle.local_addr());
        tokio::signal::ctrl_c().await?;
        hlog!("Interrupted, shutting down coordinator");
        handle.shutdown().await
    })
}

fn run_node(
    config: Config,
    id: Option<String>,
    coordinator: Option<String>,
    capacity: Option<u32>,
) -> Result<()> {
    let id = id.unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8]));
    let mut agent_config = NodeAgentConfig::from_config(id, &config);
    if let Some(address) = coordinator {
        agent_config = agent_config.with_coordinator(address);
    }
    if let Some(capacity) = capacity {
        agent_config = agent_config.with_capacity(capacity);
    }
    println!(
        "Node {} joining {} with {} slots",
        agent_config.node_id, agent_config.coordinator, agent_config.capacity
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut handle = NodeAgent::new(agent_config).spawn();
        let stopped = tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r?;
                false
            }
            _ = handle.stopped() => true,
        };
        if stopped {
            handle.join().await
        } else {
            hlog!("Interrupted, leaving cluster");
            handle.shutdown().await
        }
    })
}

fn run_program(
    mut config: Config,
    file: &Path,
    vcpus: usize,
    nodes: usize,
    timeout: Duration,
) -> Result<()> {
    if nodes == 0 {
        return Err(hive::Error::Validation("--nodes must be > 0".to_string()));
    }
    let program = load_program(file)?;
    hlog!(
        "Run command: file={} vcpus={} nodes={}",
        file.display(),
        vcpus,
        nodes
    );
    config.coordinator.listen = "127.0.0.1:0".to_string();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let coordinator = Coordinator::new(config.clone()).start().await?;
        let address = coordinator.local_addr().to_string();
        let mut agents = Vec::with_capacity(nodes);
        for i in 0..nodes {
            let agent_config = NodeAgentConfig::from_config(format!("local-{}", i), &config)
                .with_coordinator(address.clone());
            agents.push(NodeAgent::new(agent_config).spawn());
        }

        let outcome = async {
            let mut handle = coordinator
                .submit(SubmitRequest::new(program, vcpus))
                .await?;
            handle.wait_timeout(timeout).await
        }
        .await;

        for agent in agents {
            agent.shutdown().await?;
        }
        let telemetry = coordinator.telemetry();
        coordinator.shutdown().await?;

        let report = outcome?;
        let output = serde_json::json!({
            "submission": report,
            "telemetry": telemetry,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    })
}

fn run_check(config: &Config, file: &Path) -> Result<()> {
    let program = load_program(file)?;
    program.validate(&VcpuLayout::from(&config.vcpu), config.vcpu.max_program_len)?;

    let matrix = program
        .instructions()
        .iter()
        .filter(|instr| instr.class() == ExecClass::Matrix)
        .count();
    print!("{}", disassemble(&program));
    println!(
        "; {} instructions ({} scalar, {} matrix), ISA v{}",
        program.len(),
        program.len() - matrix,
        matrix,
        hive::vcpu::ISA_VERSION
    );
    Ok(())
}
