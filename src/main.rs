mod cgroup;
mod commit;
mod container;
mod error;
mod id;
mod lifecycle;
mod network;
mod nsenter;
mod overlay;
mod paths;
mod store;

use clap::{Args, Parser, Subcommand};

use crate::cgroup::ResourceConfig;
use crate::error::Result;
use crate::lifecycle::RunOptions;

#[derive(Parser)]
#[clap(name = "runcell", about = "A minimal Linux container runtime")]
struct Cli {
    /// Increase log verbosity; repeatable (-v, -vv, -vvv).
    #[clap(short, long, parse(from_occurrences), global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and start a new container.
    Run(RunArgs),
    /// Internal: the child side of the two-phase launch. Not meant to be
    /// invoked directly.
    Init,
    /// Archive a container's filesystem into a new image.
    Commit(CommitArgs),
    /// List containers.
    Ps,
    /// Print a container's log.
    Logs(NameArg),
    /// Run a command inside a running container's namespaces.
    Exec(ExecArgs),
    /// Send SIGTERM to a running container and mark it stopped.
    Stop(NameArg),
    /// Delete a stopped container's record and overlay.
    Rm(NameArg),
    /// Network management subcommands.
    #[clap(subcommand)]
    Network(NetworkCommand),
}

#[derive(Args)]
struct RunArgs {
    /// Allocate a pseudo-tty and run interactively. Mutually exclusive with -d.
    #[clap(short = 'i', long = "it")]
    tty: bool,
    /// Run the container in the background.
    #[clap(short, long)]
    detach: bool,
    /// Memory limit, e.g. "100m". Passed straight to memory.limit_in_bytes.
    #[clap(long = "mem", default_value = "")]
    mem: String,
    /// CPU quota as a percentage of one core (0 = unset).
    #[clap(long = "cpu", default_value_t = 0)]
    cpu: i64,
    /// CPU affinity list, e.g. "0,1".
    #[clap(long = "cpuset", default_value = "")]
    cpuset: String,
    /// Bind mount "host:container" into the container.
    #[clap(short = 'V', long)]
    volume: Option<String>,
    /// Container name; defaults to the generated id.
    #[clap(long = "name")]
    name: Option<String>,
    /// Extra environment variables "KEY=VALUE"; repeatable.
    #[clap(short, long = "env")]
    env: Vec<String>,
    /// Attach the container to this network.
    #[clap(long = "net")]
    network: Option<String>,
    /// Publish a port as "hostPort:containerPort"; repeatable.
    #[clap(short, long = "port")]
    port: Vec<String>,
    /// Image name, followed by the container's command and its arguments.
    #[clap(required = true)]
    command_line: Vec<String>,
}

#[derive(Args)]
struct CommitArgs {
    container_name: String,
    image_name: String,
}

#[derive(Args)]
struct NameArg {
    name: String,
}

#[derive(Args)]
struct ExecArgs {
    name: String,
    #[clap(required = true)]
    command: Vec<String>,
}

#[derive(Subcommand)]
enum NetworkCommand {
    /// Create a network.
    Create(NetworkCreateArgs),
    /// List networks.
    List,
    /// Remove a network.
    Remove(NameArg),
}

#[derive(Args)]
struct NetworkCreateArgs {
    #[clap(long = "driver", default_value = "bridge")]
    driver: String,
    #[clap(long = "subnet")]
    subnet: String,
    name: String,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init => container::init::run_init(),

        Command::Run(args) => {
            let image = args.command_line[0].clone();
            let argv = args.command_line[1..].to_vec();
            let argv = if argv.is_empty() { vec!["/bin/sh".to_string()] } else { argv };

            let name = lifecycle::run(RunOptions {
                tty: args.tty,
                detach: args.detach,
                image,
                argv,
                name: args.name,
                volume: args.volume,
                env: args.env,
                network: args.network,
                ports: args.port,
                resources: ResourceConfig {
                    memory_limit: args.mem,
                    cpu_cfs_quota: args.cpu,
                    cpu_share: String::new(),
                    cpu_set: args.cpuset,
                },
            })?;
            println!("{}", name);
            Ok(())
        }

        Command::Commit(args) => commit::commit(&args.container_name, &args.image_name),

        Command::Ps => {
            let containers = lifecycle::ps()?;
            println!("{:<12}{:<20}{:<10}{:<22}{}", "ID", "NAME", "STATUS", "CREATED", "COMMAND");
            for info in containers {
                println!(
                    "{:<12}{:<20}{:<10}{:<22}{}",
                    info.id,
                    info.name,
                    format!("{:?}", info.status),
                    info.create_time,
                    info.command
                );
            }
            Ok(())
        }

        Command::Logs(args) => {
            print!("{}", lifecycle::logs(&args.name)?);
            Ok(())
        }

        Command::Exec(args) => lifecycle::exec(&args.name, &args.command),

        Command::Stop(args) => lifecycle::stop(&args.name),

        Command::Rm(args) => lifecycle::rm(&args.name),

        Command::Network(network_command) => run_network_command(network_command),
    }
}

fn run_network_command(command: NetworkCommand) -> Result<()> {
    let manager = network::NetworkManager::new();
    match command {
        NetworkCommand::Create(args) => {
            let network = manager.create_network(&args.driver, &args.subnet, &args.name)?;
            println!("{} ({}) -> {}", network.name, network.driver, network.ip_range);
            Ok(())
        }
        NetworkCommand::List => {
            println!("{:<16}{:<10}{}", "NAME", "DRIVER", "IP_RANGE");
            for network in manager.list()? {
                println!("{:<16}{:<10}{}", network.name, network.driver, network.ip_range);
            }
            Ok(())
        }
        NetworkCommand::Remove(args) => manager.delete_network(&args.name),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        log::error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
