pub mod admin;
pub mod invocation;
pub mod my;
pub mod quote;
pub mod reminder;
pub mod report;
pub mod roles;
pub mod text;
pub mod tree;

pub use invocation::{Invocation, Response};

use crate::Data;
use serenity::all::{Context, CreateInteractionResponse, CreateInteractionResponseMessage, Interaction};
use std::sync::Arc;
use tracing::{debug, error, info_span, Instrument};
use tree::{CommandTree, CommandTreeError};

/// Every command the bot registers, in registration order.
pub fn build_tree() -> Result<CommandTree<Invocation>, CommandTreeError> {
    CommandTree::build(vec![
        admin::echo(),
        report::report(),
        my::my(),
        quote::quote(),
        quote::quotes(),
        quote::add_quote_menu(),
        reminder::reminder(),
        roles::temp_role_menu(),
        roles::regulars_role_menu(),
        admin::admin(),
        text::flip(),
        text::roll(),
        text::petpet(),
        text::targeted("bap"),
        text::targeted("boop"),
        text::targeted("bonk"),
        text::targeted("cute"),
        text::targeted("hug"),
        text::targeted("pet"),
        text::targeted("tuck"),
        text::targeted("pour"),
    ])
}

/// Routes a command or autocomplete interaction through the tree.
pub async fn handle_interaction(data: Arc<Data>, ctx: Context, interaction: Interaction) {
    let (command, autocomplete) = match interaction {
        Interaction::Command(command) => (command, false),
        Interaction::Autocomplete(command) => (command, true),
        _ => return,
    };
    let name = command.data.name.clone();
    debug!("Received command {} from {}", name, command.user.id);

    let invocation = Invocation::new(data.clone(), ctx.clone(), command.clone(), autocomplete);
    let result = data
        .commands
        .dispatch(invocation)
        .instrument(info_span!("command", command = %name))
        .await;

    if let Err(e) = result {
        error!("Command {} failed: {:#}", name, e);
        if autocomplete {
            return;
        }
        let message = CreateInteractionResponseMessage::new()
            .content(data.i18n.text(&command.locale, "base.error"))
            .ephemeral(true);
        // Fails harmlessly when the handler already responded.
        if let Err(e) = command
            .create_response(&ctx.http, CreateInteractionResponse::Message(message))
            .await
        {
            debug!("Could not send error response for {}: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i18n::{Localizer, DEFAULT_LOCALE};

    #[test]
    fn test_command_tree_builds_and_is_localized() {
        let tree = build_tree().unwrap();
        let localizer = Localizer::embedded().unwrap();
        let commands = tree.to_platform(&localizer);
        assert_eq!(commands.len(), 21);

        let json: Vec<serde_json::Value> = commands
            .iter()
            .map(|command| serde_json::to_value(command).unwrap())
            .collect();
        let my = json.iter().find(|c| c["name"] == "my").unwrap();
        let groups: Vec<&str> = my["options"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["name"].as_str().unwrap())
            .collect();
        assert_eq!(groups, ["bedtime", "birthday", "settings", "timezone"]);

        // Every slash command has its own description rather than the key fallback.
        for command in json.iter().filter(|c| c["type"] == 1) {
            let name = command["name"].as_str().unwrap();
            assert!(
                localizer.metadata_text(&format!("{}.description", name), DEFAULT_LOCALE).is_some(),
                "{} is missing metadata",
                name
            );
        }
    }
}
