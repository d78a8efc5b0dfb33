use candle_core::{Result, Tensor};

/// numerical guard inside logarithms
pub const LOG_EPS: f64 = 1e-8;

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6, f64::MAX)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * xp3.log()?)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// softplus(x) = log(1 + exp(x)), evaluated as max(x,0) + log1p(exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()? + tail
}

/// Negative binomial log-likelihood with mean `mu` and inverse
/// dispersion `theta`
///
/// ```text
/// llik(i) = Σ_g lgamma(x+θ) - lgamma(θ) - lgamma(x+1)
///               + θ log(θ/(θ+μ)) + x log(μ/(θ+μ))
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean
/// * `theta` - inverse dispersion, broadcast against `x_nd`
pub fn nb_log_likelihood(x_nd: &Tensor, mu_nd: &Tensor, theta: &Tensor) -> Result<Tensor> {
    let theta_nd = theta.broadcast_as(x_nd.shape())?;
    let log_theta_mu_eps = (theta_nd.add(mu_nd)? + LOG_EPS)?.log()?;

    let term_theta = theta_nd.mul(&((&theta_nd + LOG_EPS)?.log()? - &log_theta_mu_eps)?)?;
    let term_x = x_nd.mul(&((mu_nd + LOG_EPS)?.log()? - &log_theta_mu_eps)?)?;
    let term_gamma = ((lgamma_approx(&x_nd.add(&theta_nd)?)? - lgamma_approx(&theta_nd)?)?
        - lgamma_approx(&(x_nd + 1.)?)?)?;

    (term_theta + term_x)?.add(&term_gamma)?.sum(x_nd.rank() - 1)
}

/// Zero-inflated negative binomial log-likelihood
///
/// `pi_nd` are logits of the dropout probability:
/// ```text
/// x = 0 : log( σ(π) + σ(-π) (θ/(θ+μ))^θ )
/// x > 0 : log σ(-π) + NB(x; μ, θ)
/// ```
pub fn zinb_log_likelihood(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta: &Tensor,
    pi_nd: &Tensor,
) -> Result<Tensor> {
    let theta_nd = theta.broadcast_as(x_nd.shape())?;

    let softplus_pi = softplus(&pi_nd.neg()?)?;
    let log_theta_eps = (&theta_nd + LOG_EPS)?.log()?;
    let log_theta_mu_eps = (theta_nd.add(mu_nd)? + LOG_EPS)?.log()?;
    let pi_theta_log = (pi_nd.neg()? + theta_nd.mul(&(log_theta_eps - &log_theta_mu_eps)?)?)?;

    let case_zero = (softplus(&pi_theta_log)? - &softplus_pi)?;

    let case_non_zero = ((pi_theta_log - softplus_pi)?
        + x_nd.mul(&((mu_nd + LOG_EPS)?.log()? - &log_theta_mu_eps)?)?)?;
    let case_non_zero = ((case_non_zero + lgamma_approx(&x_nd.add(&theta_nd)?)?)?
        - lgamma_approx(&theta_nd)?)?
    .sub(&lgamma_approx(&(x_nd + 1.)?)?)?;

    let is_zero = x_nd.lt(LOG_EPS)?;
    is_zero
        .where_cond(&case_zero, &case_non_zero)?
        .sum(x_nd.rank() - 1)
}

/// Poisson log-likelihood of count data
///
/// llik(i) = Σ_g x(i,g) * log(rate(i,g)) - rate(i,g) - lgamma(x(i,g) + 1)
///
/// * `x_nd` - data tensor (observed data)
/// * `rate_nd` - rate tensor (reconstruction)
///
pub fn poisson_log_likelihood(x_nd: &Tensor, rate_nd: &Tensor) -> Result<Tensor> {
    x_nd.mul(&(rate_nd + LOG_EPS)?.log()?)?
        .sub(rate_nd)?
        .sub(&lgamma_approx(&(x_nd + 1.)?)?)?
        .sum(x_nd.rank() - 1)
}

/// Diagonal Gaussian log-density summed over the last dimension
///
/// -0.5 * Σ_k [ (z - m)^2 / v + log v + log 2π ]
pub fn gaussian_log_density(z: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let sq = z.broadcast_sub(mean)?.sqr()?.broadcast_div(var)?;
    let log_terms = sq.broadcast_add(&var.log()?)?;
    let k = log_terms.dim(log_terms.rank() - 1)? as f64;
    (log_terms.sum(log_terms.rank() - 1)? * (-0.5))? - 0.5 * k * (2. * std::f64::consts::PI).ln()
}

/// log N(z; 0, I) summed over the last dimension
pub fn standard_normal_log_density(z: &Tensor) -> Result<Tensor> {
    let k = z.dim(z.rank() - 1)? as f64;
    (z.sqr()?.sum(z.rank() - 1)? * (-0.5))? - 0.5 * k * (2. * std::f64::consts::PI).ln()
}

/// log( mean_i exp(x_i) ) along `dim`
pub fn log_mean_exp(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)? as f64;
    x.log_sum_exp(dim)? - n.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use special::Gamma;

    fn lgamma(x: f64) -> f64 {
        x.ln_gamma().0
    }

    #[test]
    fn lgamma_approx_close_to_exact() -> Result<()> {
        let xs = [0.5_f64, 1., 2.5, 7., 30.];
        let t = Tensor::new(&xs, &Device::Cpu)?;
        let approx = lgamma_approx(&t)?.to_vec1::<f64>()?;
        for (x, a) in xs.iter().zip(approx) {
            approx::assert_abs_diff_eq!(a, lgamma(*x), epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn negative_binomial_reference() -> Result<()> {
        let dev = Device::Cpu;
        let (x, mu, theta) = (3_f64, 2_f64, 1.5_f64);
        let expected = lgamma(x + theta) - lgamma(theta) - lgamma(x + 1.)
            + theta * (theta / (theta + mu)).ln()
            + x * (mu / (theta + mu)).ln();

        let llik = nb_log_likelihood(
            &Tensor::new(&[[x]], &dev)?,
            &Tensor::new(&[[mu]], &dev)?,
            &Tensor::new(&[[theta]], &dev)?,
        )?
        .to_vec1::<f64>()?;

        approx::assert_abs_diff_eq!(llik[0], expected, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn zero_inflated_reference() -> Result<()> {
        let dev = Device::Cpu;
        let (mu, theta, pi) = (2_f64, 1.5_f64, 0.3_f64);
        let p_drop = 1. / (1. + (-pi).exp());
        let nb_zero = (theta / (theta + mu)).powf(theta);
        let expected_zero = (p_drop + (1. - p_drop) * nb_zero).ln();

        let x = 4_f64;
        let expected_pos = (1. - p_drop).ln() + lgamma(x + theta)
            - lgamma(theta)
            - lgamma(x + 1.)
            + theta * (theta / (theta + mu)).ln()
            + x * (mu / (theta + mu)).ln();

        let llik = zinb_log_likelihood(
            &Tensor::new(&[[0_f64], [x]], &dev)?,
            &Tensor::new(&[[mu], [mu]], &dev)?,
            &Tensor::new(&[[theta]], &dev)?,
            &Tensor::new(&[[pi], [pi]], &dev)?,
        )?
        .to_vec1::<f64>()?;

        approx::assert_abs_diff_eq!(llik[0], expected_zero, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(llik[1], expected_pos, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn gaussian_density_matches_standard_normal() -> Result<()> {
        let dev = Device::Cpu;
        let z = Tensor::new(&[[0.5_f64, -1.0], [2.0, 0.0]], &dev)?;
        let a = gaussian_log_density(&z, &z.zeros_like()?, &z.ones_like()?)?.to_vec1::<f64>()?;
        let b = standard_normal_log_density(&z)?.to_vec1::<f64>()?;
        let expected = -0.5 * (0.25 + 1.0) - (2. * std::f64::consts::PI).ln();
        approx::assert_abs_diff_eq!(a[0], expected, epsilon = 1e-10);
        approx::assert_abs_diff_eq!(a[1], b[1], epsilon = 1e-10);
        Ok(())
    }
}
