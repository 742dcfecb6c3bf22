use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use support_chat::{
    AdminInbox, BlobStorage, ChatConfig, ChatDeps, ChatError, InMemorySessionStore, MemoryHub,
    MessageStatus, ProgressFn, StoreEvent, StoredBlob, UploadFile, UserChat,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Support desk demo: a few users chat with one agent over an in-process hub
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of user conversations
    #[arg(short, long, default_value = "3")]
    users: usize,

    /// Text messages sent by each user
    #[arg(short, long, default_value = "2")]
    messages: usize,

    /// Size of the screenshot the first user attaches, in KiB
    #[arg(short, long, default_value = "512")]
    attachment_kb: usize,

    /// Simulated upload speed, in KiB per tick
    #[arg(long, default_value = "32")]
    chunk_kb: usize,
}

/// Pretends to upload by walking the payload chunk by chunk
struct SlowStorage {
    chunk: u64,
}

#[async_trait]
impl BlobStorage for SlowStorage {
    async fn upload(
        &self,
        file: &UploadFile,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> support_chat::Result<StoredBlob> {
        let total = file.size().max(1);
        let mut sent = 0;
        while sent < total {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ChatError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(15)) => {}
            }
            sent = (sent + self.chunk).min(total);
            progress((sent * 100 / total) as u8);
        }

        let key = uuid::Uuid::new_v4();
        Ok(StoredBlob {
            file_key: Some(format!("{key}-{}", file.name)),
            thumb_key: Some(format!("{key}-thumb.png")),
            ..Default::default()
        })
    }
}

fn deps(hub: &MemoryHub, chunk: u64) -> ChatDeps {
    ChatDeps::new(Arc::new(hub.transport()), Arc::new(SlowStorage { chunk }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();
    let config = ChatConfig::default();
    config.validate().context("default config rejected")?;
    let chunk = (args.chunk_kb.max(1) * 1024) as u64;

    let hub = MemoryHub::new();
    let inbox = Arc::new(AdminInbox::new(&config, deps(&hub, chunk)));
    inbox.start().await?;
    let _refresh = inbox.spawn_history_refresh(config.history_refresh_interval());
    let inbox_loop = {
        let inbox = inbox.clone();
        tokio::spawn(async move { inbox.run().await })
    };

    let mut users = Vec::new();
    for n in 0..args.users {
        let chat = Arc::new(UserChat::new(
            format!("user-{n}"),
            &config,
            deps(&hub, chunk),
            Arc::new(InMemorySessionStore::default()),
        ));
        chat.start().await?;
        let runner = chat.clone();
        tokio::spawn(async move { runner.run().await });
        users.push(chat);
    }
    inbox.set_display_name("user-0", "Ada (billing)");

    for (n, chat) in users.iter().enumerate() {
        for i in 0..args.messages {
            chat.keystroke().await?;
            chat.send(&format!("Question {} from user {}", i + 1, n))
                .await?;
        }
    }

    if let Some(first) = users.first() {
        let mut events = first.subscribe();
        let file = UploadFile::new(
            "screenshot.png",
            "image/png",
            vec![0u8; args.attachment_kb * 1024],
        );
        let (message, task_id) = first.send_attachment(file).await?;

        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos:>3}%")?
                .progress_chars("=> "),
        );
        bar.set_message(format!("uploading {}", message.content));
        while let Some(event) = events.next().await {
            if let StoreEvent::Updated {
                local_id,
                status,
                progress,
                ..
            } = event
            {
                if local_id != message.local_id {
                    continue;
                }
                if let Some(progress) = progress {
                    bar.set_position(progress as u64);
                }
                if matches!(status, MessageStatus::Sent | MessageStatus::Failed) {
                    break;
                }
            }
        }
        bar.finish_with_message("uploaded");

        let task = first.uploads().wait(&task_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("upload task {task_id} not found"))?;
        info!(task_id = %task.id, status = ?task.status, "Upload finished");
    }

    // Let the agent's event loop catch up
    tokio::time::sleep(Duration::from_millis(100)).await;

    println!("\nInbox ({} unread):", inbox.total_unread());
    for summary in inbox.summaries() {
        println!(
            "  {:<16} {:>2} unread  {}",
            summary.display_name,
            summary.unread_count,
            summary.last_message_preview.unwrap_or_default()
        );
    }

    if let Some(first) = users.first() {
        let marked = inbox.select_conversation(first.conversation_id()).await;
        println!("\nOpened {}: marked {} seen", first.conversation_id(), marked);
        inbox.send(first.conversation_id(), "Thanks, looking into it")
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        for message in first.messages() {
            println!("  [{:?}] {:?}: {}", message.status, message.sender, message.content);
        }
    }

    for chat in &users {
        chat.stop();
    }
    inbox_loop.abort();
    Ok(())
}
