use std::path::PathBuf;

use clap::{Parser, Subcommand};
use course_rag::Result;
use course_rag::commands::{
    ask, ingest_document, init_config, purge, reap_sessions, search, show_config, show_status,
};

#[derive(Parser)]
#[command(name = "course-rag")]
#[command(about = "Course material retrieval and grounded chat over a vector store")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the configuration file
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Ingest a course document into the vector store
    Ingest {
        /// Path to the document (plain text or markdown)
        file: PathBuf,
        /// Course namespace to store the document under
        #[arg(long)]
        namespace: String,
    },
    /// Search the stored course material
    Search {
        /// The search query
        query: String,
        /// Course namespace to search (repeatable)
        #[arg(long = "namespace")]
        namespaces: Vec<String>,
        /// Number of passages to retrieve
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Ask a question and stream the grounded answer
    Ask {
        /// The question to ask
        message: String,
        /// Course namespace to ground the answer in (repeatable)
        #[arg(long = "namespace")]
        namespaces: Vec<String>,
        /// Chat to append the conversation to
        #[arg(long, default_value_t = 1)]
        chat_id: i64,
        /// User asking the question
        #[arg(long, default_value_t = 1)]
        user_id: i64,
    },
    /// Delete every vector stored under a namespace
    Purge {
        /// Course namespace to purge
        namespace: String,
    },
    /// Show the active vector backend and its statistics
    Status,
    /// Sweep streaming sessions that were abandoned mid-stream
    Reap,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config()?;
            } else {
                init_config()?;
            }
        }
        Commands::Ingest { file, namespace } => {
            ingest_document(&file, &namespace).await?;
        }
        Commands::Search {
            query,
            namespaces,
            top_k,
        } => {
            search(&query, namespaces, top_k).await?;
        }
        Commands::Ask {
            message,
            namespaces,
            chat_id,
            user_id,
        } => {
            ask(chat_id, user_id, &message, namespaces).await?;
        }
        Commands::Purge { namespace } => {
            purge(&namespace).await?;
        }
        Commands::Status => {
            show_status().await?;
        }
        Commands::Reap => {
            reap_sessions().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["course-rag", "status"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            matches!(parsed.command, Commands::Status);
        }
    }

    #[test]
    fn ingest_requires_namespace() {
        let cli = Cli::try_parse_from(["course-rag", "ingest", "notes.md"]);
        assert!(cli.is_err());

        let cli = Cli::try_parse_from([
            "course-rag",
            "ingest",
            "notes.md",
            "--namespace",
            "biology_202",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ingest { file, namespace } = parsed.command {
                assert_eq!(file, PathBuf::from("notes.md"));
                assert_eq!(namespace, "biology_202");
            }
        }
    }

    #[test]
    fn search_accepts_repeated_namespaces() {
        let cli = Cli::try_parse_from([
            "course-rag",
            "search",
            "mitosis",
            "--namespace",
            "biology_202",
            "--namespace",
            "biology_303",
        ]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Search {
                query, namespaces, ..
            } = parsed.command
            {
                assert_eq!(query, "mitosis");
                assert_eq!(namespaces, vec!["biology_202", "biology_303"]);
            }
        }
    }

    #[test]
    fn ask_defaults_chat_and_user() {
        let cli = Cli::try_parse_from(["course-rag", "ask", "What is mitosis?"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ask {
                chat_id, user_id, ..
            } = parsed.command
            {
                assert_eq!(chat_id, 1);
                assert_eq!(user_id, 1);
            }
        }
    }

    #[test]
    fn config_show_flag() {
        let cli = Cli::try_parse_from(["course-rag", "config", "--show"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Config { show } = parsed.command {
                assert!(show);
            }
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["course-rag", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["course-rag", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
