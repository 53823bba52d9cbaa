#![cfg(not(tarpaulin_include))]

use salesboard::config::AppConfig;
use salesboard::login::{CredentialStore, Role};
use std::env;
use std::io::{self, Write};

fn usage(program: &str) {
    eprintln!("Usage:");
    eprintln!("  {} add <username> [admin|viewer]   create or update a user", program);
    eprintln!("  {} passwd <username>               change a password", program);
    eprintln!("  {} remove <username>               delete a user", program);
    eprintln!("  {} list                            list users", program);
    eprintln!();
    eprintln!("The password is read from SALESBOARD_PASSWORD or prompted on stdin.");
}

fn read_password(username: &str) -> io::Result<String> {
    if let Ok(password) = env::var("SALESBOARD_PASSWORD") {
        return Ok(password);
    }
    print!("Password for {}: ", username);
    io::stdout().flush()?;
    let mut password = String::new();
    io::stdin().read_line(&mut password)?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("salesboard-users");

    let config = AppConfig::from_env()?;
    let store = CredentialStore::open(&config.credentials_file)?;

    match args.get(1).map(String::as_str) {
        Some("add") if args.len() >= 3 => {
            let username = &args[2];
            let role: Role = match args.get(3) {
                Some(role) => role.parse()?,
                None => Role::Viewer,
            };
            let password = read_password(username)?;
            store.upsert(username, &password, role)?;
            println!("Saved {} ({:?}) to {}", username, role, config.credentials_file.display());
        }
        Some("passwd") if args.len() == 3 => {
            let username = &args[2];
            let Some(existing) = store.get(username) else {
                eprintln!("Error: no user named '{}'", username);
                std::process::exit(1);
            };
            let password = read_password(username)?;
            store.upsert(username, &password, existing.role)?;
            println!("Password changed for {}", username);
        }
        Some("remove") if args.len() == 3 => {
            if store.remove(&args[2])? {
                println!("Removed {}", args[2]);
            } else {
                eprintln!("Error: no user named '{}'", args[2]);
                std::process::exit(1);
            }
        }
        Some("list") => {
            for user in store.list() {
                println!("{}\t{:?}", user.username, user.role);
            }
        }
        _ => {
            usage(program);
            std::process::exit(2);
        }
    }

    Ok(())
}
