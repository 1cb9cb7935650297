//! Command-line client for the user-lock gRPC service.
//!
//! Without a subcommand it runs the scripted demo: create two users, list,
//! get and update the first, delete the second, list again.

mod client;

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use client::proto::User;
use client::UserClient;

#[derive(Parser, Debug)]
#[command(name = "user-lock-client")]
#[command(about = "Client for the user-lock gRPC service")]
struct Cli {
    /// Server address (host:port or http:// URI)
    #[arg(long, default_value = "localhost:50051", env = "USER_LOCK_SERVER")]
    server: String,

    /// Per-call deadline in milliseconds
    #[arg(long, default_value = "10000", env = "REQUEST_TIMEOUT_MS")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a user
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        age: i32,
    },
    /// Show one user
    Get { id: i32 },
    /// List all users
    List,
    /// Overwrite a user's fields
    Update {
        id: i32,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        age: i32,
    },
    /// Delete a user
    Delete { id: i32 },
    /// Run the scripted walkthrough
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut client = UserClient::connect(&cli.server, Duration::from_millis(cli.timeout_ms)).await?;

    match cli.command.unwrap_or(Command::Demo) {
        Command::Create { name, email, age } => {
            let user = client.create_user(&name, &email, age).await?;
            print_user(&user);
        }
        Command::Get { id } => {
            let user = client.get_user(id).await?;
            print_user(&user);
        }
        Command::List => {
            for user in client.list_users().await? {
                print_user(&user);
            }
        }
        Command::Update {
            id,
            name,
            email,
            age,
        } => {
            let user = client.update_user(id, &name, &email, age).await?;
            print_user(&user);
        }
        Command::Delete { id } => {
            client.delete_user(id).await?;
            println!("User {} deleted", id);
        }
        Command::Demo => demo(&mut client).await,
    }

    Ok(())
}

fn print_user(user: &User) {
    println!(
        "  - ID: {}, Name: {}, Email: {}, Age: {}",
        user.id, user.name, user.email, user.age
    );
}

async fn print_all(client: &mut UserClient) {
    match client.list_users().await {
        Ok(users) => users.iter().for_each(print_user),
        Err(e) => warn!("{}", e),
    }
}

/// Failures are reported and the walkthrough continues.
async fn demo(client: &mut UserClient) {
    println!("=== gRPC User Service Client ===");

    println!("\n1. Creating users...");
    let first = client
        .create_user("John Doe", "john@example.com", 30)
        .await
        .inspect_err(|e| warn!("{}", e))
        .ok();
    let second = client
        .create_user("Jane Smith", "jane@example.com", 25)
        .await
        .inspect_err(|e| warn!("{}", e))
        .ok();

    println!("\n2. Listing all users...");
    print_all(client).await;

    if let Some(user) = &first {
        println!("\n3. Getting user with ID {}...", user.id);
        match client.get_user(user.id).await {
            Ok(found) => print_user(&found),
            Err(e) => warn!("{}", e),
        }

        println!("\n4. Updating user with ID {}...", user.id);
        match client
            .update_user(user.id, "John Updated", "john.updated@example.com", 31)
            .await
        {
            Ok(updated) => print_user(&updated),
            Err(e) => warn!("{}", e),
        }
    }

    if let Some(user) = &second {
        println!("\n5. Deleting user with ID {}...", user.id);
        match client.delete_user(user.id).await {
            Ok(()) => println!("  - User deleted successfully"),
            Err(e) => warn!("{}", e),
        }
    }

    println!("\n6. Final user list...");
    print_all(client).await;

    println!("\n=== Client demo completed ===");
}
