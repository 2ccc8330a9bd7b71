use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;

use crate::api;
use crate::config;
use crate::data::{self, CommentService, ListingService};
use crate::feed::{Feed, FeedError, FeedEvent, FeedOptions};
use crate::render;
use crate::session::{self, AuthContext, SessionError};
use crate::storage;

/// Read and discuss marketplace listings from the terminal.
#[derive(Parser, Debug)]
#[command(
    name = "avitolog",
    version,
    long_about = None,
    after_help = "Set AVITOLOG_LOG=debug for request logs."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List the most viewed listings
    Popular {
        /// How many listings to show (defaults to listings.popular_limit)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        limit: Option<u64>,
    },
    /// Find a listing by its marketplace URL, importing it if needed
    Search { url: String },
    /// Show a listing and its comments
    Show {
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        listing_id: i64,
        /// Number of comment pages to load
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        pages: u64,
    },
    /// Post a comment
    Comment {
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        listing_id: i64,
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Replace the text of one of your comments
    Edit {
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        listing_id: i64,
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        comment_id: i64,
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Delete one of your comments
    Delete {
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        listing_id: i64,
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        comment_id: i64,
    },
    /// Like a comment, or take the like back
    Like {
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        listing_id: i64,
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        comment_id: i64,
    },
    /// Open the listing on the marketplace in a browser
    Open {
        #[arg(value_parser = clap::value_parser!(i64).range(1..))]
        listing_id: i64,
    },
    /// Sign in and remember the session
    Login { username: String, password: String },
    /// Create an account and sign in
    Register { username: String, password: String },
    /// Forget the stored session
    Logout,
    /// Show the signed-in account
    #[command(name = "whoami")]
    WhoAmI,
}

pub fn run(cli: Cli) -> Result<()> {
    // Catch a malformed link before touching storage or the network.
    if let Command::Search { url } = &cli.command {
        data::normalize_listing_url(url)?;
    }

    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let app = App::new(cfg)?;
    let stdout = io::stdout();
    app.execute(cli.command, &mut stdout.lock())
}

struct App {
    cfg: config::Config,
    listings: Arc<dyn ListingService>,
    comments: Arc<dyn CommentService>,
    session: Arc<session::Manager>,
}

impl App {
    fn new(cfg: config::Config) -> Result<Self> {
        let store = Arc::new(
            storage::Store::open(storage::Options {
                path: cfg.storage.path.clone(),
            })
            .context("open storage")?,
        );

        let credentials = Arc::new(session::Credentials::default());
        let client = Arc::new(
            api::Client::new(
                credentials.clone(),
                api::ClientConfig {
                    user_agent: cfg.api.user_agent.clone(),
                    base_url: Some(cfg.api.base_url.clone()),
                    timeout: Some(cfg.api.timeout),
                    http_client: None,
                },
            )
            .context("create api client")?,
        );

        let listings: Arc<dyn ListingService> =
            Arc::new(data::ApiListingService::new(client.clone()));
        let comments: Arc<dyn CommentService> =
            Arc::new(data::ApiCommentService::new(client.clone()));
        let auth: Arc<dyn data::AuthService> = Arc::new(data::ApiAuthService::new(client));

        let session = Arc::new(session::Manager::new(store, auth, credentials));
        if let Some(active) = session.load_existing().context("load stored session")? {
            tracing::debug!(username = %active.user.username, "resumed session");
        }

        Ok(Self::with_services(cfg, listings, comments, session))
    }

    fn with_services(
        cfg: config::Config,
        listings: Arc<dyn ListingService>,
        comments: Arc<dyn CommentService>,
        session: Arc<session::Manager>,
    ) -> Self {
        Self {
            cfg,
            listings,
            comments,
            session,
        }
    }

    fn execute(&self, command: Command, out: &mut dyn Write) -> Result<()> {
        match command {
            Command::Popular { limit } => {
                let limit = limit
                    .map(|limit| limit as usize)
                    .unwrap_or(self.cfg.listings.popular_limit);
                let listings = self.listings.popular(limit)?;
                write_lines(out, render::listing_lines(&listings))?;
            }
            Command::Search { url } => {
                let listing = self.listings.by_url(&url)?;
                write_lines(out, render::listing_detail(&listing, render::DEFAULT_WIDTH))?;
            }
            Command::Show { listing_id, pages } => {
                let listing = self.listings.detail(listing_id)?;
                write_lines(out, render::listing_detail(&listing, render::DEFAULT_WIDTH))?;
                writeln!(out)?;

                let mut feed = self.open_feed(listing_id)?;
                for _ in 1..pages {
                    if !feed.load_more() {
                        break;
                    }
                    self.settle(&mut feed)?;
                }
                self.write_feed(&feed, out)?;
            }
            Command::Comment { listing_id, text } => {
                let text = comment_text(&text)?;
                self.require_viewer()?;
                let mut feed = self.open_feed(listing_id)?;
                feed.submit_comment(&text);
                self.settle(&mut feed)?;
                check_violations(&feed.state().violations, out)?;
                writeln!(out, "Комментарий опубликован.\n")?;
                self.write_feed(&feed, out)?;
            }
            Command::Edit {
                listing_id,
                comment_id,
                text,
            } => {
                let text = comment_text(&text)?;
                self.require_viewer()?;
                let mut feed = self.open_feed(listing_id)?;
                feed.update_comment(comment_id, &text);
                self.settle(&mut feed)?;
                check_violations(feed.state().edit_violations(), out)?;
                writeln!(out, "Комментарий {comment_id} обновлён.")?;
            }
            Command::Delete {
                listing_id,
                comment_id,
            } => {
                self.require_viewer()?;
                let mut feed = self.open_feed(listing_id)?;
                feed.delete_comment(comment_id);
                self.settle(&mut feed)?;
                writeln!(out, "Комментарий {comment_id} удалён.")?;
            }
            Command::Like {
                listing_id,
                comment_id,
            } => {
                self.require_viewer()?;
                let mut feed = self.open_feed(listing_id)?;
                let likes = Arc::new(Mutex::new(None));
                let sink = likes.clone();
                feed.subscribe(move |event, _| {
                    if let FeedEvent::Liked { likes_count, .. } = event {
                        *sink.lock() = Some(*likes_count);
                    }
                });
                feed.toggle_like(comment_id);
                self.settle(&mut feed)?;
                // Comments beyond the first page are not refetched; the like response still has the count.
                let count = feed
                    .state()
                    .comment(comment_id)
                    .map(|comment| comment.likes_count)
                    .or(*likes.lock());
                match count {
                    Some(count) => writeln!(out, "❤ {count}")?,
                    None => writeln!(out, "Готово.")?,
                }
            }
            Command::Open { listing_id } => {
                let listing = self.listings.detail(listing_id)?;
                webbrowser::open(&listing.avito_url)
                    .with_context(|| format!("open {} in browser", listing.avito_url))?;
                writeln!(out, "{}", listing.avito_url)?;
            }
            Command::Login { username, password } => {
                let session = self.session.login(&username, &password)?;
                writeln!(out, "Вы вошли как {}.", session.user.username)?;
            }
            Command::Register { username, password } => {
                let session = self.session.register(&username, &password)?;
                writeln!(out, "Аккаунт {} создан.", session.user.username)?;
            }
            Command::Logout => {
                self.session.logout()?;
                writeln!(out, "Вы вышли из аккаунта.")?;
            }
            Command::WhoAmI => match self.session.verify()? {
                Some(user) => writeln!(out, "{} (id {})", user.username, user.id)?,
                None => {
                    writeln!(out, "Вы не вошли.")?;
                    writeln!(out, "config: {}", friendly_path(config::default_path()))?;
                }
            },
        }
        Ok(())
    }

    fn require_viewer(&self) -> Result<()> {
        if !self.session.is_authenticated() {
            bail!(SessionError::NotSignedIn);
        }
        Ok(())
    }

    fn wait_timeout(&self) -> Duration {
        self.cfg.feed.wait_timeout
    }

    fn open_feed(&self, listing_id: i64) -> Result<Feed> {
        let auth: Arc<dyn AuthContext> = self.session.clone();
        let mut feed = Feed::open(
            listing_id,
            self.comments.clone(),
            auth,
            FeedOptions {
                page_size: self.cfg.feed.page_size,
            },
        );
        self.settle(&mut feed)?;
        Ok(feed)
    }

    /// Waits for in-flight work and turns a recorded failure into an error.
    fn settle(&self, feed: &mut Feed) -> Result<()> {
        if !feed.wait_idle(self.wait_timeout()) {
            bail!(
                "timed out after {} waiting for the server",
                humantime::format_duration(self.wait_timeout())
            );
        }
        match &feed.state().error {
            Some(FeedError::Unauthenticated) => bail!(SessionError::NotSignedIn),
            Some(err) => Err(anyhow!(err.clone())),
            None => Ok(()),
        }
    }

    fn write_feed(&self, feed: &Feed, out: &mut dyn Write) -> Result<()> {
        let viewer = self.session.viewer();
        write_lines(
            out,
            render::feed_lines(feed.state(), viewer.as_ref(), render::DEFAULT_WIDTH),
        )
    }
}

fn comment_text(words: &[String]) -> Result<String> {
    let text = words.join(" ");
    if text.trim().is_empty() {
        bail!("comment text is empty");
    }
    Ok(text)
}

fn check_violations(violations: &[api::Violation], out: &mut dyn Write) -> Result<()> {
    if violations.is_empty() {
        return Ok(());
    }
    write_lines(out, render::violation_lines(violations, ""))?;
    Err(anyhow!(FeedError::ValidationRejected(violations.to_vec())))
}

fn write_lines(out: &mut dyn Write, lines: Vec<String>) -> Result<()> {
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

fn friendly_path(path: Option<PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/avitolog/config.yaml".to_string()
    }
}
