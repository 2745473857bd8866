//! Boot-time tuning of the memory manager.
//!
//! Read from the kernel command line:
//!
//! - `-ul=COUNT` limits the user pool to `COUNT` pages.
//! - `-sl=KB` lets user stacks grow to `KB` kilobytes.
//!
//! Other words on the command line belong to other subsystems and are skipped.

use alloc::string::{String, ToString};
use core::fmt;
use kidneyos_shared::mem::{DEFAULT_USER_PAGES, OFFSET, PAGE_FRAME_SIZE, STACK_LIMIT};
use kidneyos_shared::sizes::KB;
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::digit1;
use nom::combinator::{all_consuming, map, map_res};
use nom::sequence::preceded;
use nom::IResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of frames in the user pool.
    pub user_pages: usize,
    /// How far below `OFFSET` a user stack may grow, in bytes.
    pub stack_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_pages: DEFAULT_USER_PAGES,
            stack_limit: STACK_LIMIT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The option was recognized but its value couldn't be parsed.
    Malformed(String),
    NoUserPages,
    StackLimitOutOfRange(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(word) => write!(f, "malformed option `{word}`"),
            Self::NoUserPages => write!(f, "user pool can't be empty"),
            Self::StackLimitOutOfRange(kb) => write!(f, "stack limit of {kb} KB out of range"),
        }
    }
}

impl core::error::Error for ConfigError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BootOption {
    UserPages(usize),
    StackLimit(usize),
}

fn decimal(input: &str) -> IResult<&str, usize> {
    map_res(digit1, str::parse)(input)
}

fn boot_option(input: &str) -> IResult<&str, BootOption> {
    alt((
        map(preceded(tag("-ul="), decimal), BootOption::UserPages),
        map(preceded(tag("-sl="), decimal), BootOption::StackLimit),
    ))(input)
}

impl VmConfig {
    pub fn from_cmdline(cmdline: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for word in cmdline.split_whitespace() {
            if !(word.starts_with("-ul=") || word.starts_with("-sl=")) {
                continue;
            }
            let (_, option) =
                all_consuming(boot_option)(word).map_err(|_| ConfigError::Malformed(word.to_string()))?;

            match option {
                BootOption::UserPages(0) => return Err(ConfigError::NoUserPages),
                BootOption::UserPages(pages) => config.user_pages = pages,
                BootOption::StackLimit(kb) => {
                    let limit = kb
                        .checked_mul(KB)
                        .filter(|&limit| (PAGE_FRAME_SIZE..OFFSET).contains(&limit))
                        .ok_or(ConfigError::StackLimitOutOfRange(kb))?;
                    config.stack_limit = limit;
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidneyos_shared::sizes::MB;

    #[test]
    fn defaults() {
        assert_eq!(VmConfig::from_cmdline(""), Ok(VmConfig::default()));
        assert_eq!(VmConfig::default().stack_limit, MB);
    }

    #[test]
    fn reads_options_among_others() {
        let config = VmConfig::from_cmdline("-q -ul=64 run 'echo x' -sl=2048").expect("valid");
        assert_eq!(config.user_pages, 64);
        assert_eq!(config.stack_limit, 2 * MB);
    }

    #[test]
    fn later_options_win() {
        let config = VmConfig::from_cmdline("-ul=8 -ul=16").expect("valid");
        assert_eq!(config.user_pages, 16);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            VmConfig::from_cmdline("-ul=12x"),
            Err(ConfigError::Malformed("-ul=12x".to_string()))
        );
        assert_eq!(
            VmConfig::from_cmdline("-sl="),
            Err(ConfigError::Malformed("-sl=".to_string()))
        );
        assert_eq!(VmConfig::from_cmdline("-ul=0"), Err(ConfigError::NoUserPages));
        assert_eq!(VmConfig::from_cmdline("-sl=2"), Err(ConfigError::StackLimitOutOfRange(2)));
        assert_eq!(
            VmConfig::from_cmdline("-sl=4194304"),
            Err(ConfigError::StackLimitOutOfRange(4_194_304))
        );
    }
}
