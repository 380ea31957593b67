pub(crate) mod backup;
pub(crate) mod check;
pub(crate) mod cleanup;
pub(crate) mod daemon;
pub(crate) mod list;
pub(crate) mod restore;
pub(crate) mod status;
pub(crate) mod verify;
