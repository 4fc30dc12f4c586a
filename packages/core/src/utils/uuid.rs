// UUID утилиты

pub fn generate_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn is_valid(uuid_str: &str) -> bool {
    uuid::Uuid::parse_str(uuid_str).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_v4() {
        let id = generate_v4();
        assert!(is_valid(&id));
        assert_ne!(id, generate_v4());
        assert!(!is_valid("not-a-uuid"));
    }
}
