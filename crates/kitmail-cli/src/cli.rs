use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "kitmail", version, about = "Mailbox sync, threading and views")]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run one sync cycle against all configured accounts.
    Sync,
    Folders(FoldersCmd),
    Messages(MessagesCmd),
    Message(MessageCmd),
}

#[derive(Args, Debug)]
pub struct FoldersCmd {
    #[command(subcommand)]
    pub command: FoldersCommand,
}

#[derive(Subcommand, Debug)]
pub enum FoldersCommand {
    List,
    Add(FolderAdd),
    Rename(FolderRename),
    Delete(FolderDelete),
}

#[derive(Args, Debug)]
pub struct FolderAdd {
    #[arg(long)]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct FolderRename {
    #[arg(long)]
    pub old: String,
    #[arg(long)]
    pub new: String,
}

#[derive(Args, Debug)]
pub struct FolderDelete {
    #[arg(long)]
    pub name: String,
}

#[derive(Args, Debug)]
pub struct MessagesCmd {
    #[command(subcommand)]
    pub command: MessagesCommand,
}

#[derive(Subcommand, Debug)]
pub enum MessagesCommand {
    List(MessagesList),
}

#[derive(Args, Debug)]
pub struct MessagesList {
    /// Real folder to list; ignored when --smart is given.
    #[arg(long)]
    pub folder: Option<String>,
    /// Smart view: unread | attachments | starred | recent:N | larger:BYTES
    #[arg(long)]
    pub smart: Option<String>,
    #[arg(long)]
    pub text: Option<String>,
    #[arg(long)]
    pub tag: Option<String>,
    #[arg(long)]
    pub starred: bool,
    /// Collapse the result into threads (parent plus member count).
    #[arg(long)]
    pub threads: bool,
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct MessageCmd {
    #[command(subcommand)]
    pub command: MessageCommand,
}

#[derive(Subcommand, Debug)]
pub enum MessageCommand {
    Star(MessageRef),
    Unstar(MessageRef),
    Tag(MessageTag),
    Note(MessageNote),
    Mark(MessageMark),
    Move(MessageMove),
    /// Soft delete: moves into Trash; deleting again purges.
    Delete(MessageRef),
    /// Permanent delete.
    Purge(MessageRef),
}

#[derive(Args, Debug)]
pub struct MessageRef {
    #[arg(long)]
    pub uid: String,
}

#[derive(Args, Debug)]
pub struct MessageTag {
    #[arg(long)]
    pub uid: String,
    #[arg(long)]
    pub tag: Vec<String>,
}

#[derive(Args, Debug)]
pub struct MessageNote {
    #[arg(long)]
    pub uid: String,
    #[arg(long)]
    pub note: String,
}

#[derive(Args, Debug)]
pub struct MessageMark {
    #[arg(long)]
    pub uid: String,
    #[arg(long)]
    pub read: bool,
    #[arg(long)]
    pub unread: bool,
}

#[derive(Args, Debug)]
pub struct MessageMove {
    #[arg(long)]
    pub uid: String,
    #[arg(long)]
    pub folder: String,
}
