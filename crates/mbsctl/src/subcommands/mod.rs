pub mod backup;
pub mod restore;

pub fn get_subcommands() -> Vec<clap::Command> {
    vec![backup::cli(), restore::cli()]
}
