pub(crate) mod conn;
pub(crate) mod establish;
mod pool;

pub use self::conn::ConnectionInfo;
pub(crate) use self::{
    conn::{
        wire::next_request_id,
        Command,
        CommandResponse,
        Connection,
        PendingConnection,
        StreamDescription,
    },
    pool::ConnectionPool,
};
