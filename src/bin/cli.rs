//! CLI for cluster administration

use clap::{Parser, Subcommand};
use clustermeta::common::format_bytes;
use clustermeta::meta::http::ClusterRequest;
use clustermeta::meta::{AdminClient, InstanceSpec};

#[derive(Parser)]
#[command(name = "clustermeta")]
#[command(about = "clustermeta cluster administration CLI")]
#[command(version)]
struct Cli {
    /// Cluster manager URL
    #[arg(long, default_value = "http://localhost:8010")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a logical room
    AddLogical { name: String },

    /// Remove an empty logical room
    DropLogical { name: String },

    /// Attach a physical room to a logical room
    AddPhysical { logical: String, physical: String },

    /// Detach a physical room
    DropPhysical { logical: String, physical: String },

    /// Move a physical room to another logical room
    MovePhysical {
        physical: String,
        from: String,
        to: String,
    },

    /// Register a storage instance
    AddInstance {
        address: String,

        /// Capacity in bytes
        #[arg(long)]
        capacity: u64,

        /// Used bytes (defaults to capacity)
        #[arg(long)]
        used: Option<u64>,

        /// Resource tag
        #[arg(long, default_value = "")]
        tag: String,

        /// Physical room
        #[arg(long, default_value = "")]
        room: String,
    },

    /// Update a storage instance
    UpdateInstance {
        address: String,

        #[arg(long)]
        capacity: u64,

        #[arg(long)]
        used: Option<u64>,

        #[arg(long, default_value = "")]
        tag: String,

        #[arg(long, default_value = "")]
        room: String,
    },

    /// Remove a storage instance
    DropInstance { address: String },

    /// Send a stats-only heartbeat on behalf of a store; placement is kept
    Heartbeat {
        address: String,

        #[arg(long)]
        capacity: u64,

        #[arg(long)]
        used: Option<u64>,

        #[arg(long, default_value = "")]
        tag: String,
    },

    /// Show rooms
    Topology,

    /// Show instances
    Instances,

    /// Pick an instance for a new replica
    Select {
        /// Resource tag
        #[arg(long, default_value = "")]
        tag: String,

        /// Addresses to skip (comma-separated)
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Least-loaded selection for this table instead of rolling
        #[arg(long)]
        table: Option<i64>,
    },

    /// Cluster status
    Status,
}

fn spec(address: String, capacity: u64, used: Option<u64>, tag: String, room: String) -> InstanceSpec {
    let spec = InstanceSpec::new(address, capacity)
        .with_resource_tag(tag)
        .with_physical_room(room);
    match used {
        Some(used) => spec.with_used_size(used),
        None => spec,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = AdminClient::new(cli.server);

    let request = match cli.command {
        Commands::AddLogical { name } => ClusterRequest::AddLogical { logical_room: name },
        Commands::DropLogical { name } => ClusterRequest::DropLogical { logical_room: name },
        Commands::AddPhysical { logical, physical } => ClusterRequest::AddPhysical {
            logical_room: logical,
            physical_room: physical,
        },
        Commands::DropPhysical { logical, physical } => ClusterRequest::DropPhysical {
            logical_room: logical,
            physical_room: physical,
        },
        Commands::MovePhysical { physical, from, to } => ClusterRequest::MovePhysical {
            physical_room: physical,
            old_logical_room: from,
            new_logical_room: to,
        },
        Commands::AddInstance {
            address,
            capacity,
            used,
            tag,
            room,
        } => ClusterRequest::AddInstance {
            instance: spec(address, capacity, used, tag, room),
        },
        Commands::UpdateInstance {
            address,
            capacity,
            used,
            tag,
            room,
        } => ClusterRequest::UpdateInstance {
            instance: spec(address, capacity, used, tag, room),
        },
        Commands::DropInstance { address } => ClusterRequest::DropInstance { address },

        Commands::Heartbeat {
            address,
            capacity,
            used,
            tag,
        } => {
            let response = client
                .instance_heartbeat(&spec(address, capacity, used, tag, String::new()))
                .await?;
            match response.status {
                Some(status) if response.known => println!("known, {}", status),
                _ => println!("unknown instance"),
            }
            return Ok(());
        }

        Commands::Topology => {
            for room in client.topology().await? {
                let physical: Vec<_> = room.physical_rooms.into_iter().collect();
                println!("{}: [{}]", room.name, physical.join(", "));
            }
            return Ok(());
        }

        Commands::Instances => {
            for instance in client.instances().await? {
                println!(
                    "{}  {}  {}/{}  tag={:?}  room={:?}",
                    instance.address,
                    instance.health.status,
                    format_bytes(instance.used_size),
                    format_bytes(instance.capacity),
                    instance.resource_tag,
                    instance.physical_room,
                );
            }
            return Ok(());
        }

        Commands::Select {
            tag,
            exclude,
            table,
        } => {
            let address = match table {
                Some(table_id) => client.select_min(&tag, &exclude, table_id).await?,
                None => client.select_rolling(&tag, &exclude).await?,
            };
            println!("{}", address);
            return Ok(());
        }

        Commands::Status => {
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
    };

    client.send(&request).await?;
    println!("OK");
    Ok(())
}
