pub use keeper_types::error::{KeeperError, Result, Stage};
