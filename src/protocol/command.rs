/// One parsed request: `NAME arg1 arg2 ...\r\n` plus, for SET and MSET, the
/// binary payload that followed the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Upper-cased command name.
    pub name: String,
    pub args: Vec<String>,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn requires_payload(&self) -> bool {
        matches!(self.name.as_str(), "SET" | "MSET")
    }

    /// Mutating commands are refused with BUSY while a snapshot pause is in
    /// effect.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.name.as_str(),
            "SET" | "DEL" | "EXPIRE" | "INCR" | "DECR" | "MSET"
        )
    }
}
