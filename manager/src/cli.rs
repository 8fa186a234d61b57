//! Command line definitions

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use webmgr::deploy::validate::parse_env_pair;
use webmgr::models::app::{AppSpec, AppType};

#[derive(Parser)]
#[command(name = "webmgr")]
#[command(about = "Deploy and manage web applications behind nginx and systemd", long_about = None)]
pub struct Cli {
    /// Treat this directory as the filesystem root (sandboxed installs)
    #[arg(long, global = true, env = "WEBMGR_ROOT")]
    pub root: Option<PathBuf>,

    /// Log to stderr at debug level and stream command output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log to stderr as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy a new application
    Add(AddArgs),

    /// Redeploy an application from its source
    Update {
        #[arg(short, long)]
        domain: String,

        /// Deploy this branch instead of the recorded one
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Reinstall dependencies and rebuild from the code already on disk
    Repair {
        #[arg(short, long)]
        domain: String,
    },

    /// Restart an application behind the updating page
    Restart {
        #[arg(short, long)]
        domain: String,
    },

    /// Remove an application, its site and its unit
    #[command(alias = "rm")]
    Remove {
        #[arg(short, long)]
        domain: String,

        /// Keep the application directory on disk
        #[arg(long)]
        keep_source: bool,

        /// Skip the safety backup
        #[arg(long)]
        no_backup: bool,
    },

    /// Show the state of one or every application
    Status {
        #[arg(short, long)]
        domain: Option<String>,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// List managed applications
    #[command(alias = "ls")]
    List {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the journal of an application
    Logs {
        #[arg(short, long)]
        domain: String,

        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,

        /// Keep streaming new lines
        #[arg(short, long)]
        follow: bool,
    },

    /// Guess the application type of a directory
    Detect {
        #[arg(long, default_value = ".")]
        directory: PathBuf,
    },

    /// List supported application types
    Types,

    /// Create directories and maintenance pages
    Setup,

    /// Add maintenance error routing to sites that lack it
    ApplyMaintenance,

    /// Turn maintenance mode on or off for an application
    Maintenance {
        #[arg(short, long)]
        domain: String,

        #[arg(long, conflicts_with = "disable", required_unless_present = "disable")]
        enable: bool,

        #[arg(long)]
        disable: bool,
    },

    /// Obtain a Let's Encrypt certificate and redirect HTTP to HTTPS
    Ssl {
        #[arg(short, long)]
        domain: String,

        /// Contact address for the certificate (defaults to admin@<domain>)
        #[arg(short, long)]
        email: Option<String>,
    },

    /// Write every application record as JSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load application records written by export
    Import {
        file: PathBuf,

        /// Overwrite records of domains that already exist
        #[arg(long)]
        replace: bool,
    },

    /// Check the host or one application for common problems
    Diagnose {
        #[arg(short, long)]
        domain: Option<String>,
    },

    /// Print version information
    Version,
}

#[derive(Args)]
pub struct AddArgs {
    /// Public domain name
    #[arg(short, long)]
    pub domain: String,

    /// Repository URL (https, ssh, git@host:path) or local directory
    #[arg(short, long)]
    pub source: String,

    /// Internal port the application listens on
    #[arg(short, long)]
    pub port: u16,

    /// Application type (nextjs, fastapi, nodejs, static)
    #[arg(short = 't', long = "type", default_value = "nextjs")]
    pub app_type: AppType,

    #[arg(short, long, default_value = "main")]
    pub branch: String,

    /// Build command run after installing dependencies
    #[arg(long)]
    pub build_command: Option<String>,

    /// Command the unit runs instead of the type default
    #[arg(long)]
    pub start_command: Option<String>,

    /// Environment variable for the application, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_parser = parse_env_arg)]
    pub env: Vec<(String, String)>,
}

impl AddArgs {
    pub fn into_spec(self) -> AppSpec {
        AppSpec {
            domain: self.domain,
            app_type: self.app_type,
            source: self.source,
            branch: self.branch,
            port: self.port,
            build_command: self.build_command,
            start_command: self.start_command,
            env_vars: self.env.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }
}

fn parse_env_arg(value: &str) -> Result<(String, String), String> {
    parse_env_pair(value).map_err(|e| e.to_string())
}
