use adda_support::api::client::{FirestoreClient, FirestoreStore};
use adda_support::config::{BackendConfig, Config};
use adda_support::identity::IdentityResolver;
use adda_support::inbox::SupportInbox;
use adda_support::storage::{self, SqliteStore};
use adda_support::store::{ChatStore, RoleDirectory};
use adda_support::ui::widget::SupportWidget;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

type Backend = (Arc<dyn ChatStore>, Arc<dyn RoleDirectory>);

fn build_backend(config: &Config) -> Result<Backend, Box<dyn Error>> {
    match &config.backend {
        BackendConfig::Local { path } => {
            let path = path
                .clone()
                .or_else(storage::default_path)
                .ok_or("no data directory for the local store")?;
            log::info!("using local store at {}", path.display());
            let store = Arc::new(SqliteStore::open(&path)?);
            let chat: Arc<dyn ChatStore> = store.clone();
            let roles: Arc<dyn RoleDirectory> = store;
            Ok((chat, roles))
        }
        BackendConfig::Firestore {
            project_id,
            api_key,
            endpoint,
        } => {
            let id_token = config.session.as_ref().and_then(|s| s.id_token.clone());
            let client = FirestoreClient::new(endpoint.as_deref(), project_id, api_key.as_deref())?
                .with_id_token(id_token);
            let store = Arc::new(FirestoreStore::new(client, &config.collection, config.poll_interval()));
            let chat: Arc<dyn ChatStore> = store.clone();
            let roles: Arc<dyn RoleDirectory> = store;
            Ok((chat, roles))
        }
    }
}

async fn show_inbox(inbox: Option<&SupportInbox>) {
    let Some(inbox) = inbox else {
        println!("(the inbox is for support staff only)");
        return;
    };
    match inbox.conversations().await {
        Ok(list) if list.is_empty() => println!("(no conversations)"),
        Ok(list) => {
            for c in list {
                let unread = if c.unread_by_admin { "*" } else { " " };
                println!(
                    "{unread} {:<28} {:<8} {}",
                    c.user_email.as_deref().unwrap_or(&c.id),
                    c.status.as_str(),
                    c.last_message
                );
            }
        }
        Err(e) => println!("!! could not load conversations: {e}"),
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = Config::load();
    let (store, roles) = match build_backend(&config) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("Failed to set up the support backend: {e}");
            std::process::exit(1);
        }
    };

    let resolver = IdentityResolver::with_privileged(roles, config.privileged());
    let identity = resolver.resolve(config.session.as_ref()).await;
    let inbox = identity
        .clone()
        .filter(|i| i.is_admin)
        .and_then(|admin| SupportInbox::new(store.clone(), admin).ok());

    let mut widget = SupportWidget::new(store);
    widget.set_identity(identity);
    widget.toggle();
    widget.refresh_summary().await;

    println!("Type a message and press enter. /toggle opens or closes the chat, /inbox lists conversations, /quit exits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    let mut last_error: Option<String> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "/quit" => break,
                    "/toggle" => widget.toggle(),
                    "/inbox" => show_inbox(inbox.as_ref()).await,
                    _ => {
                        widget.set_compose(&line);
                        if !widget.submit() {
                            println!("(not sent)");
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    log::error!("stdin: {e}");
                    break;
                }
            },
            _ = tick.tick() => widget.poll().await,
        }

        if widget.take_scroll_request() {
            if let Some(view) = widget.render() {
                print!("{}", view.to_plain());
            }
        } else if widget.error().map(str::to_string) != last_error {
            if let Some(err) = widget.error() {
                println!("!! {err}");
            }
        }
        last_error = widget.error().map(str::to_string);
    }

    widget.flush().await;
}
