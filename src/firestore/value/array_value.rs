use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|candidate| candidate == needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_values() {
        let array = ArrayValue::new(vec![FirestoreValue::from_integer(1)]);
        assert_eq!(array.values().len(), 1);
        assert!(array.contains(&FirestoreValue::from_integer(1)));
        assert!(!array.contains(&FirestoreValue::from_double(1.0)));
    }
}
