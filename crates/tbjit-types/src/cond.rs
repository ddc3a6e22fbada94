/// Comparison condition codes shared by `setcond`, `brcond`, and their 64-bit pair forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Ge = 3,
    Le = 4,
    Gt = 5,
    Ltu = 6,
    Geu = 7,
    Leu = 8,
    Gtu = 9,
}

impl Cond {
    pub const ALL: [Cond; 10] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Lt,
        Cond::Ge,
        Cond::Le,
        Cond::Gt,
        Cond::Ltu,
        Cond::Geu,
        Cond::Leu,
        Cond::Gtu,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn eval32(self, a: u32, b: u32) -> bool {
        let (sa, sb) = (a as i32, b as i32);
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => sa < sb,
            Cond::Ge => sa >= sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ltu => a < b,
            Cond::Geu => a >= b,
            Cond::Leu => a <= b,
            Cond::Gtu => a > b,
        }
    }

    pub fn eval64(self, a: u64, b: u64) -> bool {
        let (sa, sb) = (a as i64, b as i64);
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => sa < sb,
            Cond::Ge => sa >= sb,
            Cond::Le => sa <= sb,
            Cond::Gt => sa > sb,
            Cond::Ltu => a < b,
            Cond::Geu => a >= b,
            Cond::Leu => a <= b,
            Cond::Gtu => a > b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for (i, c) in Cond::ALL.iter().enumerate() {
            assert_eq!(c.as_u8() as usize, i);
            assert_eq!(Cond::from_u8(i as u8), Some(*c));
        }
        assert_eq!(Cond::from_u8(10), None);
    }

    #[test]
    fn signedness_changes_ordering() {
        let minus_one = u32::MAX;
        assert!(Cond::Lt.eval32(minus_one, 0));
        assert!(!Cond::Ltu.eval32(minus_one, 0));
        assert!(Cond::Gtu.eval32(minus_one, 0));
        assert!(Cond::Le.eval32(5, 5));
        assert!(!Cond::Gt.eval32(5, 5));

        assert!(Cond::Lt.eval64(u64::MAX, 1));
        assert!(Cond::Geu.eval64(u64::MAX, 1));
        assert!(Cond::Ne.eval64(1 << 32, 0));
    }
}
