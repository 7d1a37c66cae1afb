//! Alembic CLI — book distillation engine.
//!
//! Usage:
//!   alembic ingest --file book.txt --title "Deep Work" [--variant claims]
//!   alembic process --book <id>
//!   alembic status --book <id>
//!   alembic output --book <id>
//!
//! The PDF byte parser is an external concern; `ingest` consumes its cleaned
//! text output. Pages are approximated by form-feed splits when present.

use alembic::{
    AlembicApi, BookId, Config, OpenStore, ParsedDocument, PipelineVariant, ProgressSender,
    SqliteStore, UploadEvent,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Email used for books created from the command line.
const CLI_USER_EMAIL: &str = "cli@localhost";

#[derive(Parser)]
#[command(name = "alembic", version, about = "Idea-centered book distillation engine")]
struct Cli {
    /// Path to the SQLite database file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preprocess a cleaned-text book into an uploaded Book record
    Ingest {
        /// Cleaned text file produced by the PDF parser
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long)]
        author: Option<String>,
        /// Pipeline variant: claims or chapters
        #[arg(long, default_value = "claims")]
        variant: String,
    },
    /// Trigger processing and tail status until it finishes
    Process {
        #[arg(long)]
        book: String,
    },
    /// Print the book record
    Status {
        #[arg(long)]
        book: String,
    },
    /// Print the final markdown
    Output {
        #[arg(long)]
        book: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config = config.with_db_path(db);
    }
    let store = match SqliteStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("failed to open database at {}: {}", config.db_path.display(), e);
            std::process::exit(1);
        }
    };
    let api = AlembicApi::from_config(store, &config);

    let code = match cli.command {
        Commands::Ingest {
            file,
            title,
            author,
            variant,
        } => ingest(&api, file, title, author, &variant).await,
        Commands::Process { book } => process(&api, &book).await,
        Commands::Status { book } => status(&api, &book),
        Commands::Output { book } => output(&api, &book),
    };
    std::process::exit(code);
}

async fn ingest(
    api: &AlembicApi,
    file: PathBuf,
    title: String,
    author: Option<String>,
    variant: &str,
) -> i32 {
    let variant: PipelineVariant = match variant.parse() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {}", e);
            return 1;
        }
    };
    let text = match std::fs::read_to_string(&file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("failed to read {}: {}", file.display(), e);
            return 1;
        }
    };

    let user = match api
        .find_user(CLI_USER_EMAIL)
        .and_then(|found| match found {
            Some(user) => Ok(user),
            None => api.create_user(CLI_USER_EMAIL, "CLI"),
        }) {
        Ok(user) => user,
        Err(e) => {
            eprintln!("user setup failed: {}", e);
            return 1;
        }
    };

    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.txt".to_string());
    let pages: Vec<String> = if text.contains('\u{c}') {
        text.split('\u{c}').map(str::to_string).collect()
    } else {
        vec![text.clone()]
    };
    let document = ParsedDocument {
        title,
        author,
        filename,
        cleaned_text: text,
        pages,
    };

    let (sender, mut rx) = ProgressSender::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                UploadEvent::Progress {
                    step,
                    progress,
                    message,
                } => println!("[{:>3}%] {}: {}", progress, step, message),
                UploadEvent::Result { success: true, data, .. } => {
                    println!("done: {}", data.unwrap_or_default())
                }
                UploadEvent::Result { error, .. } => {
                    println!("failed: {}", error.unwrap_or_default())
                }
                UploadEvent::Error { error } => println!("error: {}", error),
            }
        }
    });

    let result = api.upload(&user.id, document, variant, &sender).await;
    drop(sender);
    let _ = printer.await;

    match result {
        Ok(book) => {
            println!("book id: {}", book.id);
            0
        }
        Err(e) => {
            eprintln!("ingest failed: {}", e);
            1
        }
    }
}

async fn process(api: &AlembicApi, book: &str) -> i32 {
    let book_id = BookId::from_string(book);
    if let Err(e) = api.process(&book_id) {
        eprintln!("trigger failed: {}", e);
        return 1;
    }
    println!("processing started");

    // Poll the way a UI would.
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        match api.get_book(&book_id) {
            Ok(Some(book)) => {
                println!(
                    "[{:>3}%] {} {}",
                    book.progress,
                    book.status.as_str(),
                    book.current_step.as_deref().unwrap_or("")
                );
                if book.status.is_terminal() {
                    if let Some(error) = book.error {
                        eprintln!("failed: {}", error);
                        return 1;
                    }
                    return 0;
                }
            }
            Ok(None) => {
                eprintln!("book disappeared");
                return 1;
            }
            Err(e) => {
                eprintln!("status read failed: {}", e);
                return 1;
            }
        }
    }
}

fn status(api: &AlembicApi, book: &str) -> i32 {
    match api.get_book(&BookId::from_string(book)) {
        Ok(Some(book)) => {
            println!("title:    {}", book.title);
            println!("variant:  {}", book.variant.as_str());
            println!("status:   {}", book.status.as_str());
            println!("progress: {}%", book.progress);
            if let Some(step) = book.current_step {
                println!("step:     {}", step);
            }
            if let Some(error) = book.error {
                println!("error:    {}", error);
            }
            0
        }
        Ok(None) => {
            eprintln!("book not found");
            1
        }
        Err(e) => {
            eprintln!("status read failed: {}", e);
            1
        }
    }
}

fn output(api: &AlembicApi, book: &str) -> i32 {
    match api.get_output(&BookId::from_string(book)) {
        Ok(Some(output)) => {
            println!("{}", output.markdown);
            0
        }
        Ok(None) => {
            eprintln!("no output yet (book not completed)");
            1
        }
        Err(e) => {
            eprintln!("output read failed: {}", e);
            1
        }
    }
}
