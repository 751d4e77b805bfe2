pub fn clamp01(t: f64) -> f64 {
    t.clamp(0.0, 1.0)
}

/// Overshoots slightly past 1 before settling; used for pop-in.
pub fn ease_out_back(t: f64) -> f64 {
    let c1 = 1.70158;
    let c3 = c1 + 1.0;
    1.0 + c3 * (t - 1.0).powi(3) + c1 * (t - 1.0).powi(2)
}

pub fn ease_in_out(t: f64) -> f64 {
    let t = clamp01(t);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ease_out_back_endpoints_and_overshoot() {
        assert!(ease_out_back(0.0).abs() < 1e-9);
        assert!((ease_out_back(1.0) - 1.0).abs() < 1e-9);
        assert!(ease_out_back(0.7) > 1.0);
    }

    #[test]
    fn ease_in_out_is_clamped() {
        assert_eq!(ease_in_out(-1.0), 0.0);
        assert_eq!(ease_in_out(2.0), 1.0);
        assert!((ease_in_out(0.5) - 0.5).abs() < 1e-9);
    }
}
