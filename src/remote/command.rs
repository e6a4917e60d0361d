//! Typed remote commands.
//!
//! Commands are assembled as a program plus an argument list and only turned
//! into a shell string at the last moment, with every word escaped. Nothing
//! the crate runs on an instance needs pipes or redirection.

use shell_escape::unix::escape;

use crate::device::{LIST_BLOCK_DEVICES_ARGS, LIST_BLOCK_DEVICES_PROGRAM};

/// A single command to run on the instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    privileged: bool,
}

impl RemoteCommand {
    /// Starts a command running `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privileged: false,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Marks the command as needing root.
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Program name, used in error messages.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns `true` when the command needs root.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Renders the command as an escaped shell string. Privileged commands
    /// are prefixed with `sudo` when `use_sudo` is set.
    #[must_use]
    pub fn render(&self, use_sudo: bool) -> String {
        let mut words: Vec<String> = Vec::with_capacity(self.args.len() + 2);
        if self.privileged && use_sudo {
            words.push(String::from("sudo"));
        }
        words.push(escape(self.program.as_str().into()).into_owned());
        words.extend(
            self.args
                .iter()
                .map(|arg| escape(arg.as_str().into()).into_owned()),
        );
        words.join(" ")
    }
}

const REBOOT_REQUIRED_FLAG: &str = "/var/run/reboot-required";

/// Lists whole-disk block devices, one absolute path per line.
#[must_use]
pub fn list_block_devices() -> RemoteCommand {
    RemoteCommand::new(LIST_BLOCK_DEVICES_PROGRAM).args(LIST_BLOCK_DEVICES_ARGS)
}

/// Creates an XFS filesystem on `device`.
#[must_use]
pub fn make_filesystem(device: &str) -> RemoteCommand {
    RemoteCommand::new("mkfs.xfs")
        .args(["-f", device])
        .privileged()
}

/// Creates `path` and any missing parents.
#[must_use]
pub fn make_directory(path: &str) -> RemoteCommand {
    RemoteCommand::new("mkdir").args(["-p", path]).privileged()
}

/// Prints the first entry of `path`; empty output means the directory is
/// empty.
#[must_use]
pub fn first_directory_entry(path: &str) -> RemoteCommand {
    RemoteCommand::new("find")
        .args([path, "-mindepth", "1", "-maxdepth", "1", "-print", "-quit"])
        .privileged()
}

/// Mounts `device` at `path`.
#[must_use]
pub fn mount(device: &str, path: &str) -> RemoteCommand {
    RemoteCommand::new("mount").args([device, path]).privileged()
}

/// Unmounts whatever is mounted at `path`.
#[must_use]
pub fn unmount(path: &str) -> RemoteCommand {
    RemoteCommand::new("umount").arg(path).privileged()
}

/// Exits zero when the instance's package manager has asked for a reboot.
#[must_use]
pub fn reboot_required() -> RemoteCommand {
    RemoteCommand::new("test").args(["-e", REBOOT_REQUIRED_FLAG])
}

/// Hands `path` to `user`.
#[must_use]
pub fn change_owner(user: &str, path: &str) -> RemoteCommand {
    RemoteCommand::new("chown")
        .args(["-R", user, path])
        .privileged()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(true, "sudo mount /dev/sdf /data")]
    #[case(false, "mount /dev/sdf /data")]
    fn privileged_commands_honour_sudo_toggle(#[case] use_sudo: bool, #[case] expected: &str) {
        assert_eq!(mount("/dev/sdf", "/data").render(use_sudo), expected);
    }

    #[test]
    fn arguments_are_escaped() {
        let rendered = make_directory("/mnt/my data;rm -rf /").render(false);
        assert_eq!(rendered, "mkdir -p '/mnt/my data;rm -rf /'");
    }

    #[test]
    fn reboot_check_tests_the_flag_file() {
        let command = reboot_required();
        assert!(!command.is_privileged());
        assert_eq!(command.render(true), "test -e /var/run/reboot-required");
    }

    #[test]
    fn device_listing_is_unprivileged() {
        let command = list_block_devices();
        assert!(!command.is_privileged());
        assert_eq!(command.render(true), "lsblk -dpno NAME");
    }
}
