use crate::config::Lpa;
use crate::error::FtlError;

/// Inbound operation from the request-issuing layer. Lengths count logical pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { lpa: Lpa, len: usize },
    Write { lpa: Lpa, data: Vec<u8> },
    Discard { lpa: Lpa, len: usize },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Read { .. } => "read",
            Request::Write { .. } => "write",
            Request::Discard { .. } => "discard",
        }
    }

    pub fn lpa(&self) -> Lpa {
        match self {
            Request::Read { lpa, .. } | Request::Write { lpa, .. } | Request::Discard { lpa, .. } => {
                *lpa
            }
        }
    }
}

#[derive(Debug)]
pub enum Response {
    /// Completed; reads carry the data.
    Ok(Option<Vec<u8>>),
    /// Not admitted now; the issuer should retry later.
    Requeue,
    Error(FtlError),
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, Response::Requeue)
    }
}
