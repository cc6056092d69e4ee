/// Red-black color, extended with the two transient colors Okasaki's
/// insertion balancing and Matt Might's deletion balancing need as
/// intermediate states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
    BlackBlack,
    NegativeBlack,
}

impl Color {
    #[inline]
    pub fn blacken(&mut self) {
        *self = match *self {
            Color::Red => Color::Black,
            Color::Black => Color::BlackBlack,
            Color::BlackBlack => unreachable!("double-black cannot be blackened further"),
            Color::NegativeBlack => Color::Red,
        };
    }

    #[inline]
    pub fn redden(&mut self) {
        *self = match *self {
            Color::Red => Color::NegativeBlack,
            Color::Black => Color::Red,
            Color::BlackBlack => Color::Black,
            Color::NegativeBlack => unreachable!("negative-black cannot be reddened further"),
        };
    }
}
