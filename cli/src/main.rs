mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use crate::commands::{
    CsvFiles, cmd_calendar_show, cmd_import_cms, cmd_import_csv, cmd_import_framer,
    cmd_migrate_structured, cmd_recipe_delete, cmd_recipe_list, cmd_recipe_show, cmd_tag_add,
    cmd_tag_group_add, cmd_tag_group_list, cmd_tag_list, cmd_user_add, cmd_user_list,
    cmd_user_rotate_token, cmd_user_set_role,
};
use crate::config::Config;
use potluck_core::db::Database;

#[derive(Parser)]
#[command(
    name = "potluck",
    version,
    about = "Recipe catalog and meal planner",
    long_about = "Recipe catalog and meal planner.\n\n\
        Serves the recipe API and runs admin tasks (imports, tags, users) \
        against the local database."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable token authentication; every request acts as a local admin
        #[arg(long)]
        no_auth: bool,
    },
    /// Import data from external sources
    Import {
        #[command(subcommand)]
        command: ImportCommands,
    },
    /// Run data migrations
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },
    /// Browse and manage recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Manage tag groups
    TagGroup {
        #[command(subcommand)]
        command: TagGroupCommands,
    },
    /// Manage tags
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// Manage users and API tokens
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Show a user's meal calendar
    Calendar {
        #[command(subcommand)]
        command: CalendarCommands,
    },
}

#[derive(Subcommand)]
enum ImportCommands {
    /// Import tag groups, tags and recipes from CSV files
    Csv {
        /// Tag groups CSV (name,display_order); give all three files or none
        #[arg(requires = "tags_file")]
        tag_groups_file: Option<PathBuf>,
        /// Tags CSV (name,tag_group)
        #[arg(requires = "recipes_file")]
        tags_file: Option<PathBuf>,
        /// Recipes CSV (name,slug,image_url,tags,ingredients,...)
        recipes_file: Option<PathBuf>,
        /// Tag groups CSV
        #[arg(long, value_name = "FILE", conflicts_with = "tag_groups_file")]
        tag_groups: Option<PathBuf>,
        /// Tags CSV
        #[arg(long, value_name = "FILE", conflicts_with = "tags_file")]
        tags: Option<PathBuf>,
        /// Recipes CSV
        #[arg(long, value_name = "FILE", conflicts_with = "recipes_file")]
        recipes: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a Framer CMS export directory (Tag Categories.csv, Ingredient
    /// Categories.csv, Tags.csv, Ingredients.csv, Recipes.csv)
    Framer {
        /// Directory holding the five exported CSV files
        dir: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a CMS JSON export ({recipes, tags, tagGroups})
    Cms {
        /// Path to the export file
        file: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Fill empty structured ingredient lists from recipe ingredient links
    StructuredIngredients {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// List recipes, newest first
    List {
        /// Comma-separated tag ids to filter by
        #[arg(long)]
        tags: Option<String>,
        /// Case-insensitive text search over names and tags
        #[arg(long)]
        search: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a recipe with rendered text
    Show {
        /// Recipe slug
        slug: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a recipe
    Delete {
        /// Recipe slug
        slug: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TagGroupCommands {
    /// List tag groups with their tags
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a tag group
    Add {
        /// Group name
        name: String,
        /// Sort position (lower first)
        #[arg(long, default_value = "0")]
        order: i64,
        /// Whether the group holds recipe tags or ingredient tags: recipe, ingredient
        #[arg(long)]
        kind: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TagCommands {
    /// Add a tag to a group
    Add {
        /// Tag group name
        group: String,
        /// Tag name
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all tags
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Add a user and print their API token
    Add {
        /// Email address
        email: String,
        /// Role: viewer, contributor, admin
        #[arg(long, default_value = "viewer")]
        role: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List users
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a user's role
    SetRole {
        /// Email address
        email: String,
        /// Role: viewer, contributor, admin
        role: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replace a user's API token and print the new one
    RotateToken {
        /// Email address
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CalendarCommands {
    /// Show one month of a user's calendar
    Show {
        /// User email
        #[arg(long)]
        user: String,
        /// Month (YYYY-MM, default: current month)
        #[arg(long)]
        month: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "potluck=info,potluck_core=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::open(&config.db_path)?;
    tracing::debug!(db = %config.db_path.display(), data_dir = %config.data_dir.display(), "opened database");

    match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => server::start_server(db, port, &bind, no_auth).await,
        Commands::Import { command } => match command {
            ImportCommands::Csv {
                tag_groups_file,
                tags_file,
                recipes_file,
                tag_groups,
                tags,
                recipes,
                json,
            } => {
                let files = CsvFiles {
                    tag_groups: tag_groups_file.or(tag_groups),
                    tags: tags_file.or(tags),
                    recipes: recipes_file.or(recipes),
                };
                cmd_import_csv(&db, &files, json)
            }
            ImportCommands::Framer { dir, json } => cmd_import_framer(&db, &dir, json),
            ImportCommands::Cms { file, json } => cmd_import_cms(&db, &file, json),
        },
        Commands::Migrate { command } => match command {
            MigrateCommands::StructuredIngredients { json } => cmd_migrate_structured(&db, json),
        },
        Commands::Recipe { command } => match command {
            RecipeCommands::List { tags, search, json } => {
                cmd_recipe_list(&db, tags.as_deref(), search.as_deref(), json)
            }
            RecipeCommands::Show { slug, json } => cmd_recipe_show(&db, &slug, json),
            RecipeCommands::Delete { slug, json } => cmd_recipe_delete(&db, &slug, json),
        },
        Commands::TagGroup { command } => match command {
            TagGroupCommands::List { json } => cmd_tag_group_list(&db, json),
            TagGroupCommands::Add {
                name,
                order,
                kind,
                json,
            } => cmd_tag_group_add(&db, &name, order, kind.as_deref(), json),
        },
        Commands::Tag { command } => match command {
            TagCommands::Add { group, name, json } => cmd_tag_add(&db, &group, &name, json),
            TagCommands::List { json } => cmd_tag_list(&db, json),
        },
        Commands::User { command } => match command {
            UserCommands::Add { email, role, json } => cmd_user_add(&db, &email, &role, json),
            UserCommands::List { json } => cmd_user_list(&db, json),
            UserCommands::SetRole { email, role, json } => {
                cmd_user_set_role(&db, &email, &role, json)
            }
            UserCommands::RotateToken { email, json } => cmd_user_rotate_token(&db, &email, json),
        },
        Commands::Calendar { command } => match command {
            CalendarCommands::Show { user, month, json } => {
                cmd_calendar_show(&db, &user, month, json)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_csv_accepts_positional_or_flags() {
        let cli = Cli::try_parse_from(["potluck", "import", "csv", "g.csv", "t.csv", "r.csv"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["potluck", "import", "csv", "--recipes", "r.csv"]);
        assert!(cli.is_ok());

        // Positional form needs all three files
        let cli = Cli::try_parse_from(["potluck", "import", "csv", "g.csv"]);
        assert!(cli.is_err());
    }

    #[test]
    fn import_framer_takes_a_directory() {
        let cli = Cli::try_parse_from(["potluck", "import", "framer", "export/", "--json"]);
        assert!(cli.is_ok());
        assert!(Cli::try_parse_from(["potluck", "import", "framer"]).is_err());
    }
}
