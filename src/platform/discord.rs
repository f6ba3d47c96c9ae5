use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    ActivityData, ChannelId, Client, ConnectionStage, Context as GatewayContext, CreateMessage,
    EditMessage, EventHandler, GatewayIntents, Http, Message, MessageId, Ready, ResumedEvent,
    ShardStageUpdateEvent, Timestamp,
};
use serenity::gateway::GatewayError;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bot::{guarded, Session};
use crate::platform::{ChatChannel, IncomingMessage, MessageHandle};

pub const PONG: &str = "Pong! 🏓";
pub const PING_FAILED: &str = "❌ An error occurred";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Invalid Discord token provided")]
    AuthFailure,

    #[error("failed to open OpenRouter HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Discord client error: {0}")]
    Gateway(#[from] serenity::Error),

    #[error("startup aborted: {0}")]
    Aborted(String),
}

impl StartupError {
    fn from_gateway(e: serenity::Error) -> Self {
        match e {
            serenity::Error::Gateway(GatewayError::InvalidAuthentication) => StartupError::AuthFailure,
            other => StartupError::Gateway(other),
        }
    }
}

/// Outcome of the gateway loop, taking aborts recorded during setup into
/// account.
fn startup_outcome(session: &Session, result: serenity::Result<()>) -> Result<(), StartupError> {
    result.map_err(StartupError::from_gateway)?;
    match session.startup_failure() {
        Some(reason) => Err(StartupError::Aborted(reason.to_string())),
        None => Ok(()),
    }
}

/// [`ChatChannel`] over serenity's REST client.
pub struct DiscordChannel {
    http: Arc<Http>,
}

impl DiscordChannel {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatChannel for DiscordChannel {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<MessageHandle> {
        let sent = ChannelId::new(channel_id)
            .send_message(&self.http, CreateMessage::new().content(content))
            .await?;
        Ok(MessageHandle {
            channel_id,
            message_id: sent.id.get(),
        })
    }

    async fn edit_message(&self, handle: &MessageHandle, content: &str) -> Result<()> {
        ChannelId::new(handle.channel_id)
            .edit_message(
                &self.http,
                MessageId::new(handle.message_id),
                EditMessage::new().content(content),
            )
            .await?;
        Ok(())
    }
}

fn incoming_message(msg: &Message) -> IncomingMessage {
    IncomingMessage {
        author_id: msg.author.id.get(),
        author_name: msg.author.name.clone(),
        author_is_bot: msg.author.bot,
        channel_id: msg.channel_id.get(),
        text: msg.content.clone(),
        timestamp: message_time(&msg.timestamp),
    }
}

fn message_time(timestamp: &Timestamp) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&timestamp.to_string())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            DateTime::<Utc>::from_timestamp(timestamp.unix_timestamp(), 0).unwrap_or_default()
        })
}

/// Gateway callbacks, all routed through the session.
pub struct Handler {
    session: Arc<Session>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: GatewayContext, ready: Ready) {
        info!("Bot is ready! Logged in as {} (ID: {})", ready.user.name, ready.user.id);
        info!(
            "Monitoring channel ID: {}",
            self.session.relay.allowed_channel_id()
        );
        ctx.set_activity(Some(ActivityData::listening("your messages")));
    }

    async fn message(&self, ctx: GatewayContext, new_message: Message) {
        if self.session.is_closed() {
            return;
        }
        let chat = DiscordChannel::new(ctx.http.clone());
        let incoming = incoming_message(&new_message);
        guarded(
            "on_message",
            self.session.relay.handle_message(&chat, &incoming),
        )
        .await;
    }

    async fn resume(&self, _ctx: GatewayContext, _event: ResumedEvent) {
        info!("Bot resumed connection to Discord");
    }

    async fn shard_stage_update(&self, _ctx: GatewayContext, event: ShardStageUpdateEvent) {
        if event.new == ConnectionStage::Disconnected {
            warn!(shard = ?event.shard_id, "Bot disconnected from Discord");
        }
    }
}

/// Command framework data.
pub struct Data {
    pub session: Arc<Session>,
}

pub type CommandContext<'a> = poise::Context<'a, Data, anyhow::Error>;

fn private_reply(content: impl Into<String>) -> poise::CreateReply {
    poise::CreateReply::default()
        .content(content)
        .ephemeral(true)
}

/// Replies with Pong! 🏓
#[poise::command(slash_command)]
pub async fn ping(ctx: CommandContext<'_>) -> Result<()> {
    match ctx.send(private_reply(PONG)).await {
        Ok(_) => info!(
            "Ping command used by {} (monitoring {})",
            ctx.author().name,
            ctx.data().session.relay.allowed_channel_id()
        ),
        Err(e) => {
            error!("Error in ping command: {}", e);
            if let Err(e) = ctx.send(private_reply(PING_FAILED)).await {
                error!("Error sending ping failure reply: {}", e);
            }
        }
    }
    Ok(())
}

/// User-facing classification of a failed slash command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandFailure {
    Cooldown(Duration),
    MissingPermissions,
    BotMissingPermissions,
    Other,
}

impl CommandFailure {
    pub fn classify(error: &poise::FrameworkError<'_, Data, anyhow::Error>) -> Self {
        match error {
            poise::FrameworkError::CooldownHit {
                remaining_cooldown,
                ..
            } => CommandFailure::Cooldown(*remaining_cooldown),
            poise::FrameworkError::MissingUserPermissions { .. } => {
                CommandFailure::MissingPermissions
            }
            poise::FrameworkError::MissingBotPermissions { .. } => {
                CommandFailure::BotMissingPermissions
            }
            _ => CommandFailure::Other,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CommandFailure::Cooldown(remaining) => format!(
                "⏰ Command is on cooldown. Try again in {:.2} seconds.",
                remaining.as_secs_f64()
            ),
            CommandFailure::MissingPermissions => {
                "❌ You don't have permission to use this command.".to_string()
            }
            CommandFailure::BotMissingPermissions => {
                "❌ I don't have the required permissions to execute this command.".to_string()
            }
            CommandFailure::Other => {
                "❌ An error occurred while processing your command.".to_string()
            }
        }
    }
}

async fn on_command_error(error: poise::FrameworkError<'_, Data, anyhow::Error>) {
    let failure = CommandFailure::classify(&error);

    let Some(ctx) = error.ctx() else {
        // Setup and event-handler errors have no interaction to answer.
        match error {
            poise::FrameworkError::Setup { error, .. } => error!("Error in setup: {:#}", error),
            other => {
                if let Err(e) = poise::builtins::on_error(other).await {
                    error!("Error while handling framework error: {}", e);
                }
            }
        }
        return;
    };

    if let poise::FrameworkError::Command { error: cause, .. } = &error {
        error!(kind = ?failure, "Slash command error in /{}: {:#}", ctx.command().name, cause);
    } else {
        error!(kind = ?failure, "Slash command error in /{}", ctx.command().name);
    }

    // send() answers the interaction, or follows up if it was already answered.
    if let Err(e) = ctx.send(private_reply(failure.message())).await {
        error!("Error sending error message: {}", e);
    }
}

/// Open the HTTP client, connect to Discord and dispatch events until the
/// gateway shuts down.
pub async fn run(session: Arc<Session>, token: &str) -> Result<(), StartupError> {
    session.completion().open().await?;

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let data_session = session.clone();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![ping()],
            on_error: |error| Box::pin(on_command_error(error)),
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                // Without user data poise never answers a command, so a failed
                // sync takes the whole bot down.
                let commands = &framework.options().commands;
                if let Err(e) = poise::builtins::register_globally(ctx, commands).await {
                    data_session
                        .abort_startup(format!("failed to sync slash commands: {e}"))
                        .await;
                    return Err(e.into());
                }
                info!(
                    "Synced {} slash commands",
                    framework.options().commands.len()
                );
                Ok(Data {
                    session: data_session,
                })
            })
        })
        .build();

    let mut client = Client::builder(token, intents)
        .framework(framework)
        .event_handler(Handler {
            session: session.clone(),
        })
        .await?;

    session.attach_gateway(client.shard_manager.clone()).await;

    let signal_session = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Bot shutdown requested");
            signal_session.shutdown().await;
        }
    });

    info!("Starting Discord bot...");
    let result = client.start().await;
    startup_outcome(&session, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompletionConfig, Config, DiscordConfig};

    #[test]
    fn test_cooldown_message_has_two_decimals() {
        let failure = CommandFailure::Cooldown(Duration::from_millis(4_250));
        assert_eq!(
            failure.message(),
            "⏰ Command is on cooldown. Try again in 4.25 seconds."
        );
    }

    #[test]
    fn test_permission_messages() {
        assert_eq!(
            CommandFailure::MissingPermissions.message(),
            "❌ You don't have permission to use this command."
        );
        assert_eq!(
            CommandFailure::BotMissingPermissions.message(),
            "❌ I don't have the required permissions to execute this command."
        );
        assert_eq!(
            CommandFailure::Other.message(),
            "❌ An error occurred while processing your command."
        );
    }

    #[test]
    fn test_invalid_authentication_is_auth_failure() {
        let err = StartupError::from_gateway(serenity::Error::Gateway(
            GatewayError::InvalidAuthentication,
        ));
        assert!(matches!(err, StartupError::AuthFailure));
        assert_eq!(err.to_string(), "Invalid Discord token provided");
    }

    #[test]
    fn test_other_gateway_errors_pass_through() {
        let err = StartupError::from_gateway(serenity::Error::Other("shard died"));
        assert!(matches!(err, StartupError::Gateway(_)));
    }

    #[test]
    fn test_ping_reply_is_private_pong() {
        let reply = private_reply(PONG);
        assert_eq!(reply.content.as_deref(), Some("Pong! 🏓"));
        assert_eq!(reply.ephemeral, Some(true));
    }

    #[test]
    fn test_message_time_keeps_subseconds() {
        let timestamp = Timestamp::parse("2024-05-01T12:34:56.789Z").unwrap();
        let time = message_time(&timestamp);
        assert_eq!(time.timestamp(), 1_714_566_896);
        assert_eq!(time.timestamp_subsec_millis(), 789);
    }

    fn session() -> Session {
        Session::new(&Config {
            discord: DiscordConfig {
                token: "token".into(),
                allowed_channel_id: 1,
            },
            completion: CompletionConfig::default(),
        })
    }

    #[test]
    fn test_clean_exit_is_ok() {
        assert!(startup_outcome(&session(), Ok(())).is_ok());
    }

    #[tokio::test]
    async fn test_setup_abort_turns_clean_exit_into_error() {
        let session = session();
        session
            .abort_startup("failed to sync slash commands: 403".to_string())
            .await;

        match startup_outcome(&session, Ok(())) {
            Err(StartupError::Aborted(reason)) => {
                assert_eq!(reason, "failed to sync slash commands: 403")
            }
            other => panic!("expected aborted startup, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_wins_over_recorded_abort() {
        let session = session();
        session.abort_startup("late".to_string()).await;
        let result = startup_outcome(
            &session,
            Err(serenity::Error::Gateway(GatewayError::InvalidAuthentication)),
        );
        assert!(matches!(result, Err(StartupError::AuthFailure)));
    }

    #[test]
    fn test_ping_command_is_a_slash_command() {
        let command = ping();
        assert_eq!(command.name, "ping");
        assert!(command.slash_action.is_some());
        assert!(command.parameters.is_empty());
        assert_eq!(command.description.as_deref(), Some("Replies with Pong! 🏓"));
    }
}
