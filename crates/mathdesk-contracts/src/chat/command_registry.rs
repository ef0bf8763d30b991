#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "model",
    action: "set_model",
}];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "upload",
        action: "upload",
    },
    CommandSpec {
        command: "image",
        action: "upload",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/upload <path>",
    "/image <path>",
    "/model <name>",
    "/status",
    "/help",
    "exit",
];
