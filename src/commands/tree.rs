//! Declarative command tree.
//!
//! Commands are declared as nested [`CommandNode`]s. A node is either a leaf with a handler
//! (and possibly options) or a group of children; [`CommandTree::build`] rejects anything
//! else. The built tree registers with the platform as nested subcommand options and routes
//! each interaction down to the selected leaf.

use crate::i18n::{Localizer, DEFAULT_LOCALE};
use poise::BoxFuture;
use serenity::all::{CommandOptionType, CommandType, CreateCommand, CreateCommandOption, Permissions};
use std::collections::HashMap;
use thiserror::Error;

pub type Handler<I> = fn(I) -> BoxFuture<'static, anyhow::Result<()>>;

/// Wraps an `async fn(I) -> anyhow::Result<()>` into a [`Handler`].
#[macro_export]
macro_rules! handler {
    ($f:path) => {
        |call| Box::pin($f(call))
    };
}

/// What the tree needs from an incoming call to route it.
pub trait Routable: Send + 'static {
    fn command_name(&self) -> &str;
    /// Removes one level of subcommand nesting and returns the selected name.
    fn take_subcommand(&mut self) -> Option<String>;
    /// Records the localization key of the node being entered.
    fn enter(&mut self, key: &str);
    fn is_autocomplete(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    String,
    Integer,
    Boolean,
    User,
    Attachment,
}

impl OptionKind {
    fn platform(self) -> CommandOptionType {
        match self {
            OptionKind::String => CommandOptionType::String,
            OptionKind::Integer => CommandOptionType::Integer,
            OptionKind::Boolean => CommandOptionType::Boolean,
            OptionKind::User => CommandOptionType::User,
            OptionKind::Attachment => CommandOptionType::Attachment,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Choice {
    Int(i32),
    Str(&'static str),
}

#[derive(Debug, Clone)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub required: bool,
    pub autocomplete: bool,
    pub choices: Vec<Choice>,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl OptionSpec {
    pub fn new(name: &'static str, kind: OptionKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            autocomplete: false,
            choices: Vec::new(),
            min: None,
            max: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn autocomplete(mut self) -> Self {
        self.autocomplete = true;
        self
    }

    pub fn choices(mut self, choices: impl IntoIterator<Item = Choice>) -> Self {
        self.choices = choices.into_iter().collect();
        self
    }

    pub fn range(mut self, min: u64, max: u64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Everyone,
    Moderator,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    #[default]
    Slash,
    User,
    Message,
}

pub struct CommandNode<I> {
    pub name: &'static str,
    pub kind: Kind,
    pub access: Access,
    pub options: Vec<OptionSpec>,
    pub handler: Option<Handler<I>>,
    pub autocomplete: Option<Handler<I>>,
    pub children: Vec<CommandNode<I>>,
}

impl<I> CommandNode<I> {
    pub fn leaf(name: &'static str, handler: Handler<I>) -> Self {
        Self {
            name,
            kind: Kind::Slash,
            access: Access::Everyone,
            options: Vec::new(),
            handler: Some(handler),
            autocomplete: None,
            children: Vec::new(),
        }
    }

    pub fn group(name: &'static str, children: Vec<CommandNode<I>>) -> Self {
        Self {
            name,
            kind: Kind::Slash,
            access: Access::Everyone,
            options: Vec::new(),
            handler: None,
            autocomplete: None,
            children,
        }
    }

    /// Right-click command on a member.
    pub fn user_menu(name: &'static str, handler: Handler<I>) -> Self {
        Self {
            kind: Kind::User,
            ..Self::leaf(name, handler)
        }
    }

    /// Right-click command on a message.
    pub fn message_menu(name: &'static str, handler: Handler<I>) -> Self {
        Self {
            kind: Kind::Message,
            ..Self::leaf(name, handler)
        }
    }

    pub fn option(mut self, option: OptionSpec) -> Self {
        self.options.push(option);
        self
    }

    pub fn on_autocomplete(mut self, handler: Handler<I>) -> Self {
        self.autocomplete = Some(handler);
        self
    }

    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandTreeError {
    #[error("command {0} has both subcommands and a handler or options")]
    Mixed(String),
    #[error("command {0} has neither subcommands nor a handler")]
    Empty(String),
    #[error("command {0} is declared twice")]
    Duplicate(String),
    #[error("context menu command {0} cannot have options or subcommands")]
    MenuShape(String),
    #[error("command {0} nests deeper than two subcommand levels")]
    TooDeep(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("command {0} does not exist")]
    UnknownCommand(String),
    #[error("subcommand {child} does not exist for parent command {parent}")]
    UnknownSubcommand { parent: String, child: String },
    #[error("no subcommand given for parent command {0}")]
    MissingSubcommand(String),
    #[error("command {0} has no autocomplete handler")]
    NoAutocomplete(String),
}

struct Built<I> {
    key: String,
    node: CommandNode<I>,
    children: HashMap<&'static str, Built<I>>,
}

pub struct CommandTree<I> {
    roots: HashMap<&'static str, Built<I>>,
    order: Vec<&'static str>,
}

impl<I: Routable> CommandTree<I> {
    pub fn build(roots: Vec<CommandNode<I>>) -> Result<Self, CommandTreeError> {
        let mut built = HashMap::new();
        let mut order = Vec::new();
        for root in roots {
            let name = root.name;
            if built.contains_key(name) {
                return Err(CommandTreeError::Duplicate(name.to_string()));
            }
            built.insert(name, Self::build_node(root, None, 0)?);
            order.push(name);
        }
        Ok(Self { roots: built, order })
    }

    fn build_node(mut node: CommandNode<I>, parent: Option<&str>, depth: usize) -> Result<Built<I>, CommandTreeError> {
        let key = match parent {
            Some(parent) => format!("{}/{}", parent, node.name),
            None => node.name.to_string(),
        };

        let has_children = !node.children.is_empty();
        if has_children && (node.handler.is_some() || !node.options.is_empty()) {
            return Err(CommandTreeError::Mixed(key));
        }
        if !has_children && node.handler.is_none() {
            return Err(CommandTreeError::Empty(key));
        }
        if node.kind != Kind::Slash && (has_children || !node.options.is_empty()) {
            return Err(CommandTreeError::MenuShape(key));
        }
        if has_children && depth >= 2 {
            return Err(CommandTreeError::TooDeep(key));
        }

        let mut children = HashMap::new();
        for child in std::mem::take(&mut node.children) {
            let name = child.name;
            if children.contains_key(name) {
                return Err(CommandTreeError::Duplicate(format!("{}/{}", key, name)));
            }
            children.insert(name, Self::build_node(child, Some(&key), depth + 1)?);
        }
        Ok(Built { key, node, children })
    }

    /// Walks `call` down to its leaf, recording the leaf's key on the call.
    fn resolve(&self, call: &mut I) -> Result<&Built<I>, DispatchError> {
        let name = call.command_name().to_string();
        let mut current = self
            .roots
            .get(name.as_str())
            .ok_or(DispatchError::UnknownCommand(name))?;
        while !current.children.is_empty() {
            let child = call
                .take_subcommand()
                .ok_or_else(|| DispatchError::MissingSubcommand(current.key.clone()))?;
            current = current
                .children
                .get(child.as_str())
                .ok_or_else(|| DispatchError::UnknownSubcommand {
                    parent: current.key.clone(),
                    child,
                })?;
        }
        call.enter(&current.key);
        Ok(current)
    }

    pub async fn dispatch(&self, mut call: I) -> anyhow::Result<()> {
        let node = self.resolve(&mut call)?;
        let handler = if call.is_autocomplete() {
            node.node
                .autocomplete
                .ok_or_else(|| DispatchError::NoAutocomplete(node.key.clone()))?
        } else {
            node.node
                .handler
                .ok_or_else(|| DispatchError::MissingSubcommand(node.key.clone()))?
        };
        handler(call).await
    }

    /// Platform registration payloads with localized names and descriptions.
    pub fn to_platform(&self, localizer: &Localizer) -> Vec<CreateCommand> {
        self.order
            .iter()
            .filter_map(|name| self.roots.get(name))
            .map(|root| Self::root_command(root, localizer))
            .collect()
    }

    fn root_command(root: &Built<I>, localizer: &Localizer) -> CreateCommand {
        let mut command = CreateCommand::new(root.node.name);
        for (locale, name) in localized(localizer, &format!("{}.name", root.key)) {
            command = command.name_localized(locale, name);
        }

        command = match root.node.kind {
            Kind::Slash => {
                command = command.kind(CommandType::ChatInput).description(description(localizer, &root.key));
                for (locale, text) in localized(localizer, &format!("{}.description", root.key)) {
                    command = command.description_localized(locale, text);
                }
                command
            }
            Kind::User => command.kind(CommandType::User),
            Kind::Message => command.kind(CommandType::Message),
        };

        command = match root.node.access {
            Access::Everyone => command,
            Access::Moderator => command.default_member_permissions(Permissions::MANAGE_MESSAGES),
            Access::Admin => command.default_member_permissions(Permissions::ADMINISTRATOR),
        };

        if root.children.is_empty() {
            for option in &root.node.options {
                command = command.add_option(option_builder(option, &root.key, localizer));
            }
        } else {
            for child in ordered_children(root) {
                command = command.add_option(Self::subcommand(child, localizer));
            }
        }
        command
    }

    fn subcommand(node: &Built<I>, localizer: &Localizer) -> CreateCommandOption {
        let kind = if node.children.is_empty() {
            CommandOptionType::SubCommand
        } else {
            CommandOptionType::SubCommandGroup
        };
        let mut option = CreateCommandOption::new(kind, node.node.name, description(localizer, &node.key));
        option = localize_option(option, &node.key, localizer);

        if node.children.is_empty() {
            for spec in &node.node.options {
                option = option.add_sub_option(option_builder(spec, &node.key, localizer));
            }
        } else {
            for child in ordered_children(node) {
                option = option.add_sub_option(Self::subcommand(child, localizer));
            }
        }
        option
    }
}

fn ordered_children<I>(node: &Built<I>) -> Vec<&Built<I>> {
    let mut children: Vec<&Built<I>> = node.children.values().collect();
    children.sort_by(|a, b| a.key.cmp(&b.key));
    children
}

fn option_builder(spec: &OptionSpec, command_key: &str, localizer: &Localizer) -> CreateCommandOption {
    let key = format!("{}.options.{}", command_key, spec.name);
    let mut option = CreateCommandOption::new(spec.kind.platform(), spec.name, description(localizer, &key))
        .required(spec.required)
        .set_autocomplete(spec.autocomplete);
    option = localize_option(option, &key, localizer);
    if let Some(min) = spec.min {
        option = option.min_int_value(min);
    }
    if let Some(max) = spec.max {
        option = option.max_int_value(max);
    }

    for choice in &spec.choices {
        let value = match choice {
            Choice::Int(v) => v.to_string(),
            Choice::Str(v) => v.to_string(),
        };
        let choice_key = format!("{}.choices.{}", key, value);
        let name = localizer
            .metadata_text(&choice_key, DEFAULT_LOCALE)
            .unwrap_or(value.as_str())
            .to_string();
        let locales = localized(localizer, &choice_key);
        option = match choice {
            Choice::Int(v) => option.add_int_choice_localized(name, *v, locales),
            Choice::Str(v) => option.add_string_choice_localized(name, *v, locales),
        };
    }
    option
}

fn localize_option(mut option: CreateCommandOption, key: &str, localizer: &Localizer) -> CreateCommandOption {
    for (locale, name) in localized(localizer, &format!("{}.name", key)) {
        option = option.name_localized(locale, name);
    }
    for (locale, text) in localized(localizer, &format!("{}.description", key)) {
        option = option.description_localized(locale, text);
    }
    option
}

fn description(localizer: &Localizer, key: &str) -> String {
    localizer
        .metadata_text(&format!("{}.description", key), DEFAULT_LOCALE)
        .map(str::to_string)
        .unwrap_or_else(|| key.replace('/', " "))
}

/// Translations other than the default locale, in a stable order.
fn localized(localizer: &Localizer, key: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = localizer
        .metadata(key)
        .map(|locales| {
            locales
                .iter()
                .filter(|(locale, _)| locale.as_str() != DEFAULT_LOCALE)
                .map(|(locale, text)| (locale.clone(), text.clone()))
                .collect()
        })
        .unwrap_or_default();
    entries.sort();
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeCall {
        name: String,
        path: Vec<String>,
        key: String,
        log: Log,
        autocomplete: bool,
    }

    impl FakeCall {
        fn new(path: &[&str], log: &Log) -> Self {
            Self {
                name: path[0].to_string(),
                path: path[1..].iter().map(|s| s.to_string()).collect(),
                key: String::new(),
                log: log.clone(),
                autocomplete: false,
            }
        }
    }

    impl Routable for FakeCall {
        fn command_name(&self) -> &str {
            &self.name
        }

        fn take_subcommand(&mut self) -> Option<String> {
            if self.path.is_empty() {
                None
            } else {
                Some(self.path.remove(0))
            }
        }

        fn enter(&mut self, key: &str) {
            self.key = key.to_string();
        }

        fn is_autocomplete(&self) -> bool {
            self.autocomplete
        }
    }

    async fn record(call: FakeCall) -> anyhow::Result<()> {
        let tag = if call.autocomplete { "auto:" } else { "" };
        call.log.lock().unwrap().push(format!("{}{}", tag, call.key));
        Ok(())
    }

    fn sample() -> Vec<CommandNode<FakeCall>> {
        vec![
            CommandNode::leaf("echo", handler!(record))
                .option(OptionSpec::new("text", OptionKind::String).required())
                .access(Access::Admin),
            CommandNode::group(
                "my",
                vec![
                    CommandNode::group(
                        "bedtime",
                        vec![
                            CommandNode::leaf("set", handler!(record)),
                            CommandNode::leaf("get", handler!(record)),
                        ],
                    ),
                    CommandNode::leaf("zone", handler!(record)).on_autocomplete(handler!(record)),
                ],
            ),
            CommandNode::user_menu("Assign Role", handler!(record)),
        ]
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_leaf() {
        let log = Log::default();
        let tree = CommandTree::build(sample()).unwrap();

        tree.dispatch(FakeCall::new(&["my", "bedtime", "get"], &log)).await.unwrap();
        tree.dispatch(FakeCall::new(&["echo"], &log)).await.unwrap();
        let mut auto = FakeCall::new(&["my", "zone"], &log);
        auto.autocomplete = true;
        tree.dispatch(auto).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["my/bedtime/get", "echo", "auto:my/zone"]);
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let log = Log::default();
        let tree = CommandTree::build(sample()).unwrap();

        let err = tree
            .dispatch(FakeCall::new(&["my", "birthday"], &log))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DispatchError>(),
            Some(&DispatchError::UnknownSubcommand {
                parent: "my".into(),
                child: "birthday".into()
            })
        );
        assert_eq!(
            err.to_string(),
            "subcommand birthday does not exist for parent command my"
        );

        let err = tree.dispatch(FakeCall::new(&["my"], &log)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<DispatchError>(),
            Some(&DispatchError::MissingSubcommand("my".into()))
        );

        let err = tree.dispatch(FakeCall::new(&["nope"], &log)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DispatchError>(),
            Some(DispatchError::UnknownCommand(_))
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_build_rejects_bad_shapes() {
        let mixed = CommandNode::group("quotes", vec![CommandNode::leaf("get", handler!(record))]);
        let mixed = CommandNode {
            handler: Some(handler!(record)),
            ..mixed
        };
        assert_eq!(
            CommandTree::build(vec![mixed]).err(),
            Some(CommandTreeError::Mixed("quotes".into()))
        );

        let options_on_group = CommandNode::group("my", vec![CommandNode::leaf("get", handler!(record))])
            .option(OptionSpec::new("x", OptionKind::String));
        assert!(matches!(
            CommandTree::build(vec![options_on_group]),
            Err(CommandTreeError::Mixed(_))
        ));

        let empty: CommandNode<FakeCall> = CommandNode::group("void", Vec::new());
        assert_eq!(
            CommandTree::build(vec![empty]).err(),
            Some(CommandTreeError::Empty("void".into()))
        );

        let dupes = vec![
            CommandNode::leaf("flip", handler!(record)),
            CommandNode::leaf("flip", handler!(record)),
        ];
        assert_eq!(
            CommandTree::build(dupes).err(),
            Some(CommandTreeError::Duplicate("flip".into()))
        );

        let menu = CommandNode::user_menu("Hug", handler!(record))
            .option(OptionSpec::new("x", OptionKind::String));
        assert!(matches!(
            CommandTree::build(vec![menu]),
            Err(CommandTreeError::MenuShape(_))
        ));
    }

    #[test]
    fn test_platform_payload_is_nested_and_localized() {
        let meta = r#"
            ["my/bedtime"]
            description = "Bedtime settings"
            ["my/bedtime/set"]
            description = "Set your bedtime"
            ["echo"]
            description = "Echo text"
            ["echo".options.text]
            description = "What to say"
        "#;
        let meta_fr = r#"
            ["my/bedtime/set"]
            name = "definir"
            description = "Definir l'heure du coucher"
        "#;
        let localizer = Localizer::from_sources(&[], &[("en-US", meta), ("fr", meta_fr)]).unwrap();
        let tree = CommandTree::build(sample()).unwrap();
        let commands: Vec<serde_json::Value> = tree
            .to_platform(&localizer)
            .iter()
            .map(|c| serde_json::to_value(c).unwrap())
            .collect();

        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0]["name"], "echo");
        assert_eq!(commands[0]["description"], "Echo text");
        assert_eq!(commands[0]["options"][0]["description"], "What to say");
        assert_eq!(commands[0]["default_member_permissions"], "8");

        let my = &commands[1];
        let bedtime = &my["options"][0];
        assert_eq!(bedtime["name"], "bedtime");
        assert_eq!(bedtime["type"], 2);
        let set = bedtime["options"]
            .as_array()
            .unwrap()
            .iter()
            .find(|o| o["name"] == "set")
            .unwrap();
        assert_eq!(set["type"], 1);
        assert_eq!(set["description"], "Set your bedtime");
        assert_eq!(set["name_localizations"]["fr"], "definir");

        assert_eq!(commands[2]["type"], 2);
    }
}
