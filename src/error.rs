use crate::reactor::ConnId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Text(&'static str),

    #[error("could not resolve {host}:{port}")]
    AddressUnresolvable { host: String, port: u16 },

    #[error("error binding socket: {0}")]
    BindFailed(std::io::Error),

    #[error("error listening: {0}")]
    ListenFailed(std::io::Error),

    #[error("error initiating connect: {0}")]
    Connect(std::io::Error),

    #[error("no such connection: {0:?}")]
    UnknownConnection(ConnId),
}

pub type Result<T> = std::result::Result<T, Error>;
