use num_format::{CustomFormat, Grouping};

/// Number format for log lines, e.g. `1_234_567`
pub fn number_format() -> CustomFormat {
    CustomFormat::builder()
        .grouping(Grouping::Standard)
        .minus_sign("-")
        .separator("_")
        .build()
        .expect("static number format should be valid")
}

#[cfg(test)]
mod tests {
    use num_format::ToFormattedString;

    use super::*;

    #[test]
    fn test_number_format_groups_with_underscore() {
        assert_eq!(1_234_567_usize.to_formatted_string(&number_format()), "1_234_567");
        assert_eq!(999_usize.to_formatted_string(&number_format()), "999");
    }
}
