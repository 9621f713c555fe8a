/// Command parsing for `@<bot>` mentions in pull request comments
use std::fmt;

/// A parsed command from a comment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteCommand {
    /// Rebuild the preview from the current head of the branch
    Rebuild,
    /// Tear the preview down and free its ports
    Stop,
    /// Reply with the preview link and state
    Status,
    /// Reply with the list of commands
    Help,
}

impl SiteCommand {
    pub const ALL: [SiteCommand; 4] = [Self::Rebuild, Self::Stop, Self::Status, Self::Help];

    pub fn verb(self) -> &'static str {
        match self {
            Self::Rebuild => "rebuild",
            Self::Stop => "stop",
            Self::Status => "status",
            Self::Help => "help",
        }
    }

    fn from_verb(word: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|command| command.verb().eq_ignore_ascii_case(word))
    }
}

impl fmt::Display for SiteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// Result of parsing a comment for commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// No mention of the bot in the comment
    NoMention,
    /// Bot was mentioned but the command was not recognized
    UnrecognizedCommand {
        /// The unrecognized command text that was attempted
        attempted: String,
    },
    /// A valid command was found
    Command(SiteCommand),
}

/// Parse a comment body for commands addressed to `bot_login`
///
/// The mention must be at the beginning of a line (after trimming), followed by
/// whitespace and the command verb. Matching is case-insensitive.
///
/// # First Mention Wins
///
/// The parser stops at the **first** line that starts with the mention, even if that
/// mention has no command or an unknown one; later lines are not scanned.
///
/// - `@bot` alone returns `UnrecognizedCommand { attempted: "" }`
/// - `@bot typo` returns `UnrecognizedCommand { attempted: "typo" }`
/// - `@botrebuild` is not a mention (no whitespace boundary)
pub fn parse_comment(body: &str, bot_login: &str) -> ParseResult {
    let mention = format!("@{}", bot_login);

    for line in body.lines() {
        let trimmed = line.trim();

        // Safe prefix extraction: avoids panicking on non-ASCII input
        let Some(prefix) = trimmed.get(..mention.len()) else {
            continue;
        };
        if !prefix.eq_ignore_ascii_case(&mention) {
            continue;
        }

        let rest = &trimmed[mention.len()..];

        if rest.is_empty() {
            return ParseResult::UnrecognizedCommand {
                attempted: String::new(),
            };
        }

        if !rest.starts_with(|c: char| c.is_whitespace()) {
            continue;
        }

        let command_word = rest.split_whitespace().next().unwrap_or_default();

        return match SiteCommand::from_verb(command_word) {
            Some(command) => ParseResult::Command(command),
            None => ParseResult::UnrecognizedCommand {
                attempted: command_word.to_string(),
            },
        };
    }

    ParseResult::NoMention
}
