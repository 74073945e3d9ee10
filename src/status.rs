use std::fmt;

/// The outcome of a request, as seen by a client.
///
/// Every variant maps to a fixed sentinel string that the transport layer
/// sends back verbatim. The strings are part of the client protocol and
/// must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The request succeeded.
    Ok,
    /// An upsert created a new mapping.
    OkInserted,
    /// An upsert replaced an existing mapping.
    OkUpdated,
    /// The credentials did not match a registered user, or the user is not
    /// allowed to make this request.
    ErrLogin,
    /// Registration of a name that is already taken.
    ErrUserExists,
    /// The user named as the target of a request does not exist.
    ErrNoUser,
    /// The key does not exist, or already exists for an insert.
    ErrKey,
    /// An argument was empty or too long.
    ErrMsgFmt,
    /// The request matched nothing to return.
    ErrNoData,
    /// The upload quota for the current window is spent.
    ErrQuotaUp,
    /// The download quota for the current window is spent.
    ErrQuotaDown,
    /// The request quota for the current window is spent.
    ErrQuotaReq,
    /// A map/reduce function could not be registered or found.
    ErrSo,
}

/// The payload of a request that returns data: either the data or the
/// error status explaining why there is none.
pub type Reply = Result<Vec<u8>, Status>;

impl Status {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::OkInserted => "OKINS",
            Status::OkUpdated => "OKUPD",
            Status::ErrLogin => "ERR_LOGIN",
            Status::ErrUserExists => "ERR_USER_EXISTS",
            Status::ErrNoUser => "ERR_NO_USER",
            Status::ErrKey => "ERR_KEY",
            Status::ErrMsgFmt => "ERR_MSG_FMT",
            Status::ErrNoData => "ERR_NO_DATA",
            Status::ErrQuotaUp => "ERR_QUOTA_UP",
            Status::ErrQuotaDown => "ERR_QUOTA_DOWN",
            Status::ErrQuotaReq => "ERR_QUOTA_REQ",
            Status::ErrSo => "ERR_SO",
        }
    }

    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::OkInserted | Status::OkUpdated)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_str().as_bytes().to_vec()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flattens a reply into the `(is_error, payload)` pair the transport
/// layer encrypts and sends.
pub fn into_wire(reply: Reply) -> (bool, Vec<u8>) {
    match reply {
        Ok(data) => (false, data),
        Err(status) => (true, status.to_vec()),
    }
}
