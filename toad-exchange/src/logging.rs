use toad_msg::Code;

use crate::msg::{Kind, Message};

/// `2.05`
pub(crate) fn code_to_human(code: Code) -> String {
  format!("{}.{:02}", code.class, code.detail)
}

/// One-line description of a message, for logs
pub(crate) fn msg_summary(msg: &Message) -> String {
  let kind = match msg.kind() {
    | Kind::Empty => "Empty",
    | Kind::Request => "Request",
    | Kind::Response => "Response",
    | Kind::Reserved => "Reserved",
  };

  let observe = msg.observe
                   .map(|seq| format!(" (observe {})", seq))
                   .unwrap_or_default();

  format!("{}: {:?} {} {:?} {:?}{} with {} byte payload",
          kind,
          msg.ty,
          code_to_human(msg.code),
          msg.id,
          msg.token,
          observe,
          msg.payload.len())
}
