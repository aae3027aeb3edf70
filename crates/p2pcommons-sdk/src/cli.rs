//! Command line front end for a local engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use p2pcommons_meta::IndexField;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::engine::{Engine, ModuleView};

/// `p2pcommons` command line.
#[derive(Parser)]
#[command(name = "p2pcommons")]
#[command(about = "Create, update and resolve p2pcommons modules", long_about = None)]
pub struct Cli {
    /// Base directory for settings, the index and module files.
    #[arg(short, long, env = "P2PCOMMONS_DIR", default_value = ".p2pcommons")]
    pub base_dir: PathBuf,

    /// JSON engine configuration; overrides the defaults, not `--base-dir`.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Keep the index and drives in memory.
    #[arg(long)]
    pub in_memory: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Module type selector.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum TypeArg {
    /// Content modules.
    Content,
    /// Profile modules.
    Profile,
}

/// Indexed field selector.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum FieldArg {
    /// Module title.
    Title,
    /// Module description.
    Description,
}

impl From<FieldArg> for IndexField {
    fn from(field: FieldArg) -> Self {
        match field {
            FieldArg::Title => IndexField::Title,
            FieldArg::Description => IndexField::Description,
        }
    }
}

/// Engine operations.
#[derive(Subcommand)]
pub enum Command {
    /// Create a module.
    Init {
        /// Module type.
        #[arg(value_enum)]
        module_type: TypeArg,
        /// Title.
        title: String,
        /// Description.
        #[arg(short, long)]
        description: Option<String>,
        /// Subtype.
        #[arg(short, long)]
        subtype: Option<String>,
    },
    /// Show a local module.
    Get {
        /// Module url or key.
        url: String,
    },
    /// List local modules.
    List {
        /// Only modules of this type.
        #[arg(short = 't', long = "type", value_enum)]
        module_type: Option<TypeArg>,
    },
    /// Search titles or descriptions.
    Filter {
        /// Field to search.
        #[arg(value_enum)]
        field: FieldArg,
        /// Case-insensitive substring.
        query: String,
    },
    /// Update fields from a JSON object.
    Set {
        /// Module url or key.
        url: String,
        /// Flat JSON object of fields.
        fields: String,
        /// Replace list fields instead of merging.
        #[arg(short, long)]
        force: bool,
    },
    /// Register content in a profile.
    Register {
        /// Content url, optionally versioned.
        content: String,
        /// Profile url.
        profile: String,
    },
    /// Remove content from a profile.
    Deregister {
        /// Content url, optionally versioned.
        content: String,
        /// Profile url.
        profile: String,
    },
    /// Follow a profile.
    Follow {
        /// Following profile.
        profile: String,
        /// Profile to follow.
        target: String,
    },
    /// Stop following a profile.
    Unfollow {
        /// Following profile.
        profile: String,
        /// Followed profile.
        target: String,
    },
    /// Fetch a module.
    Clone {
        /// Module url, optionally versioned.
        url: String,
        /// Write the module files to disk.
        #[arg(short, long)]
        download: bool,
    },
    /// Check that a content snapshot is registered by its authors.
    Verify {
        /// Versioned content url.
        url: String,
    },
    /// Delete a local module.
    Delete {
        /// Module url or key.
        url: String,
        /// Also move the files to the trash.
        #[arg(long)]
        files: bool,
    },
    /// Re-import a module directory.
    Refresh {
        /// Module url or key.
        url: String,
    },
}

impl Cli {
    /// Engine configuration selected by the flags.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => EngineConfig::default(),
        };
        config.base_dir = self.base_dir.clone();
        if self.in_memory {
            config.persist = false;
        }
        Ok(config)
    }

    /// Opens an engine, runs the command and closes the engine.
    pub async fn run(self) -> Result<()> {
        let engine = Engine::open(self.engine_config()?).await?;
        let outcome = self.execute(&engine).await;
        engine.close().await?;
        outcome
    }

    async fn execute(&self, engine: &Engine) -> Result<()> {
        match &self.command {
            Command::Init {
                module_type,
                title,
                description,
                subtype,
            } => {
                let mut params = json!({
                    "type": type_name(*module_type),
                    "title": title,
                });
                if let Some(description) = description {
                    params["description"] = json!(description);
                }
                if let Some(subtype) = subtype {
                    params["subtype"] = json!(subtype);
                }
                print(&engine.init(params).await?)
            }
            Command::Get { url } => print(&engine.get(url).await?),
            Command::List { module_type } => {
                let modules: Vec<ModuleView> = match module_type {
                    None => engine.list().await?,
                    Some(TypeArg::Content) => engine.list_content().await?,
                    Some(TypeArg::Profile) => engine.list_profiles().await?,
                };
                print(&modules)
            }
            Command::Filter { field, query } => {
                print(&engine.filter((*field).into(), query).await?)
            }
            Command::Set { url, fields, force } => {
                let fields: Value =
                    serde_json::from_str(fields).context("fields must be a JSON object")?;
                print(&engine.set(url, fields, *force).await?)
            }
            Command::Register { content, profile } => {
                print(&engine.register(content, profile).await?)
            }
            Command::Deregister { content, profile } => {
                print(&engine.deregister(content, profile).await?)
            }
            Command::Follow { profile, target } => print(&engine.follow(profile, target).await?),
            Command::Unfollow { profile, target } => {
                print(&engine.unfollow(profile, target).await?)
            }
            Command::Clone { url, download } => {
                print(&engine.clone_module(url, *download).await?)
            }
            Command::Verify { url } => print(&json!({ "verified": engine.verify(url).await? })),
            Command::Delete { url, files } => {
                engine.delete(url, *files).await?;
                Ok(())
            }
            Command::Refresh { url } => print(&engine.refresh(url).await?),
        }
    }
}

fn type_name(module_type: TypeArg) -> &'static str {
    match module_type {
        TypeArg::Content => "content",
        TypeArg::Profile => "profile",
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
