//! Distributed (search overlay) dialect message codes (§6.1).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributedCode {
    Ping,
    SearchRequest,
    BranchLevel,
    BranchRoot,
    ServerSearchRequest,
    Other(u32),
}

impl DistributedCode {
    pub fn code(self) -> u32 {
        match self {
            Self::Ping => 0,
            Self::SearchRequest => 3,
            Self::BranchLevel => 4,
            Self::BranchRoot => 5,
            Self::ServerSearchRequest => 93,
            Self::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ping,
            3 => Self::SearchRequest,
            4 => Self::BranchLevel,
            5 => Self::BranchRoot,
            93 => Self::ServerSearchRequest,
            other => Self::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips() {
        for code in [
            DistributedCode::Ping,
            DistributedCode::SearchRequest,
            DistributedCode::BranchLevel,
            DistributedCode::BranchRoot,
        ] {
            assert_eq!(DistributedCode::from_code(code.code()), code);
        }
    }
}
