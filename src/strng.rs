use arcstr::ArcStr;

/// Strng is a cheaply clonable string type, used for hostnames and other
/// small strings that are copied around liberally.
pub type Strng = ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	s.as_ref().into()
}
