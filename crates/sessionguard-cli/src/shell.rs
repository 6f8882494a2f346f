//! Line-oriented command shell over a `SessionContext`.

use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{debug, warn};

use sessionguard_core::models::subscription::EXPIRING_SOON_DAYS;
use sessionguard_core::{
    AuthError, Config, LoginCredentials, RegistrationData, SessionContext, SessionEvent, SubscriptionStatus,
};

const PROMPT: &str = "sessionguard> ";

const HELP: &str = "\
Commands:
  login [--remember]   Sign in (remembered sessions survive restarts)
  register             Create an account and sign in
  logout               Sign out and forget stored credentials
  whoami               Show the signed-in user and subscription
  status               Ask the server whether the session is still valid
  get <path>           Authenticated GET, prints the JSON response
  help                 Show this help
  quit                 Exit";

/// Environment variable holding an optional bot-verification token for login
const BOT_TOKEN_ENV: &str = "SESSIONGUARD_BOT_TOKEN";

pub struct Shell {
    session: SessionContext,
    config: Config,
    input: Lines<BufReader<Stdin>>,
}

impl Shell {
    pub fn new(session: SessionContext, config: Config) -> Self {
        Self {
            session,
            config,
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Read commands from stdin until `quit` or end of input.
    pub async fn run(&mut self) -> Result<()> {
        self.spawn_event_printer();

        match self.session.state().user {
            Some(ref user) => println!("Signed in as {}.", user.display_name()),
            None => println!("Not signed in. Type `login` to start, `help` for commands."),
        }

        loop {
            print!("{}", PROMPT);
            std::io::stdout().flush()?;

            let Some(line) = self.input.next_line().await? else {
                println!();
                return Ok(());
            };
            if self.run_command(&line).await? {
                return Ok(());
            }
        }
    }

    /// Execute one command line. Returns true when the shell should exit.
    pub async fn run_command(&mut self, line: &str) -> Result<bool> {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return Ok(false);
        };
        let args: Vec<&str> = parts.collect();
        debug!(command, ?args, "Running command");

        match command {
            "login" => self.login(args.contains(&"--remember")).await?,
            "register" => self.register().await?,
            "logout" => {
                self.session.logout().await;
                println!("Signed out.");
            }
            "whoami" => self.whoami(),
            "status" => {
                if self.session.check_auth_status().await {
                    println!("Session is valid.");
                } else {
                    println!("Not signed in.");
                }
            }
            "get" => match args.first() {
                Some(path) => self.get(path).await,
                None => println!("Usage: get <path>"),
            },
            "help" | "?" => println!("{}", HELP),
            "quit" | "exit" => return Ok(true),
            other => println!("Unknown command `{}`. Type `help` for commands.", other),
        }
        Ok(false)
    }

    fn spawn_event_printer(&self) {
        let mut events = self.session.events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::Invalidated(_) => {
                        println!("\nYour session expired. Please `login` again.")
                    }
                    SessionEvent::ForcedRedirect(target) => {
                        println!("\nThe server asks you to visit {}", target)
                    }
                }
            }
        });
    }

    async fn login(&mut self, remember_me: bool) -> Result<()> {
        let last = self.config.last_identifier.clone();
        let identifier = self.prompt_line("Username", last.as_deref()).await?;
        let secret = prompt_secret().await?;

        let mut credentials = LoginCredentials::new(identifier.clone(), secret);
        if let Ok(token) = std::env::var(BOT_TOKEN_ENV) {
            credentials = credentials.with_bot_token(token);
        }

        println!("\nAuthenticating...");
        match self.session.login(&credentials, remember_me).await {
            Ok(user) => {
                println!("Signed in as {}.", user.display_name());
                self.config.last_identifier = Some(identifier);
                if let Err(e) = self.config.save() {
                    warn!(error = %e, "Failed to save config");
                }
            }
            Err(e) => println!("{}", user_message(&e)),
        }
        Ok(())
    }

    async fn register(&mut self) -> Result<()> {
        let email = self.prompt_line("Email", None).await?;
        let name = self.prompt_line("Name (optional)", None).await?;
        let secret = prompt_secret().await?;

        let data = RegistrationData {
            email,
            secret,
            name: Some(name).filter(|n| !n.is_empty()),
            extra: Default::default(),
        };
        match self.session.register(&data).await {
            Ok(user) => println!("Welcome, {}!", user.display_name()),
            Err(e) => println!("{}", user_message(&e)),
        }
        Ok(())
    }

    fn whoami(&self) {
        let state = self.session.state();
        let Some(user) = state.user else {
            match state.error {
                Some(error) => println!("Not signed in ({}).", error),
                None => println!("Not signed in."),
            }
            return;
        };

        println!("{}", user.display_name());
        if let Some(ref email) = user.email {
            println!("  email:        {}", email);
        }
        if let Some(scope) = self.session.credentials().active_scope() {
            println!("  session:      {}", scope);
        }
        let status = self.session.subscription_status();
        match status {
            SubscriptionStatus::Active | SubscriptionStatus::ExpiringSoon => println!(
                "  subscription: {} ({} days left)",
                status,
                self.session.remaining_subscription_days()
            ),
            _ => println!("  subscription: {}", status),
        }
        if self.session.is_subscription_expiring_soon() {
            println!("  Renew within {} days to keep access.", EXPIRING_SOON_DAYS);
        }
    }

    async fn get(&self, path: &str) {
        match self.session.pipeline().get_json::<serde_json::Value>(path).await {
            Ok(value) => match serde_json::to_string_pretty(&value) {
                Ok(pretty) => println!("{}", pretty),
                Err(e) => println!("Failed to format response: {}", e),
            },
            Err(e) => println!("Request failed: {}", e),
        }
    }

    async fn prompt_line(&mut self, label: &str, default: Option<&str>) -> Result<String> {
        match default {
            Some(value) => print!("{} [{}]: ", label, value),
            None => print!("{}: ", label),
        }
        std::io::stdout().flush()?;

        let input = self.input.next_line().await?.unwrap_or_default();
        let input = input.trim();

        Ok(match default {
            Some(value) if input.is_empty() => value.to_string(),
            _ => input.to_string(),
        })
    }
}

/// Friendly text for an auth failure shown inline
fn user_message(error: &AuthError) -> String {
    match error {
        AuthError::InvalidCredentials => "Invalid username or password.".to_string(),
        AuthError::BotVerificationFailure => "Bot verification failed. Please try again.".to_string(),
        AuthError::NetworkOrServerFailure(e) => {
            format!("Unable to reach the server ({}). Check your connection.", e)
        }
        e if e.is_fatal() => "Your session expired. Please sign in again.".to_string(),
        e => format!("Sign-in failed: {}", e),
    }
}

async fn prompt_secret() -> Result<String> {
    tokio::task::spawn_blocking(|| rpassword::prompt_password("Password: "))
        .await
        .context("Password prompt task failed")?
        .context("Failed to read password")
}
